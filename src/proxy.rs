//! Remote proxy transport hooks.
//!
//! The proxy layer rides the correlated request/response plane: a
//! `proxy_call` names a module path, an attribute path and two opaque
//! argument blobs; the reply is an opaque result or a structured error.
//! Marshaling is the caller's concern. The node contributes exactly two
//! guarantees — correlation by envelope id and bounded in-flight
//! concurrency — plus a per-node allow-list of module paths (never a
//! process-wide registry).

use crate::net::envelope::{ProxyArgs, ProxyCallPayload, ProxyOutcome};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Executes allowed proxy calls. Implementations should stay cheap; heavy
/// work belongs on the blocking pool the registry already routes through.
pub trait ProxyHandler: Send + Sync {
    fn call(
        &self,
        module_path: &str,
        attr_path: &str,
        args: &[u8],
        kwargs: &[u8],
    ) -> Result<Vec<u8>, String>;
}

/// Refuses everything; the default when a node exposes no modules.
pub struct DenyAllHandler;

impl ProxyHandler for DenyAllHandler {
    fn call(&self, module_path: &str, _: &str, _: &[u8], _: &[u8]) -> Result<Vec<u8>, String> {
        Err(format!("no handler registered for {module_path}"))
    }
}

pub struct ProxyRegistry {
    allowed: HashSet<String>,
    handler: Arc<dyn ProxyHandler>,
    permits: Arc<Semaphore>,
}

impl ProxyRegistry {
    pub fn new(
        allowed: impl IntoIterator<Item = String>,
        handler: Arc<dyn ProxyHandler>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
            handler,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// A module path is allowed when it or one of its ancestors was
    /// configured (`pkg.mod` admits `pkg.mod.sub`).
    pub fn is_allowed(&self, module_path: &str) -> bool {
        if self.allowed.contains(module_path) {
            return true;
        }
        let mut prefix = module_path;
        while let Some(idx) = prefix.rfind('.') {
            prefix = &prefix[..idx];
            if self.allowed.contains(prefix) {
                return true;
            }
        }
        false
    }

    /// Execute one call under the in-flight bound.
    pub(crate) async fn dispatch(&self, payload: &ProxyCallPayload) -> ProxyOutcome {
        if !self.is_allowed(&payload.module_path) {
            debug!("refusing proxy call to {}", payload.module_path);
            return ProxyOutcome::Err {
                kind: "refused".to_string(),
                reason: format!("module {} is not exposed", payload.module_path),
            };
        }

        let Ok(_permit) = self.permits.acquire().await else {
            return ProxyOutcome::Err {
                kind: "unavailable".to_string(),
                reason: "proxy shutting down".to_string(),
            };
        };

        let handler = self.handler.clone();
        let module = payload.module_path.clone();
        let attr = payload.attr_path.clone();
        let args = payload.args.to_vec();
        let kwargs = payload.kwargs.to_vec();

        let result = tokio::task::spawn_blocking(move || {
            handler.call(&module, &attr, &args, &kwargs)
        })
        .await;

        match result {
            Ok(Ok(bytes)) => match ProxyArgs::new(bytes) {
                Some(out) => ProxyOutcome::Ok(out),
                None => ProxyOutcome::Err {
                    kind: "oversized".to_string(),
                    reason: "result exceeds wire limit".to_string(),
                },
            },
            Ok(Err(reason)) => ProxyOutcome::Err {
                kind: "call_failed".to_string(),
                reason,
            },
            Err(e) => ProxyOutcome::Err {
                kind: "panic".to_string(),
                reason: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl ProxyHandler for Echo {
        fn call(&self, _: &str, _: &str, args: &[u8], _: &[u8]) -> Result<Vec<u8>, String> {
            Ok(args.to_vec())
        }
    }

    fn payload(module: &str) -> ProxyCallPayload {
        ProxyCallPayload {
            module_path: module.to_string(),
            attr_path: "f".to_string(),
            args: ProxyArgs::new(vec![1, 2, 3]).unwrap(),
            kwargs: ProxyArgs::default(),
        }
    }

    #[test]
    fn prefix_allow_list() {
        let reg = ProxyRegistry::new(["pkg.mod".to_string()], Arc::new(Echo), 4);
        assert!(reg.is_allowed("pkg.mod"));
        assert!(reg.is_allowed("pkg.mod.sub"));
        assert!(!reg.is_allowed("pkg"));
        assert!(!reg.is_allowed("pkg.other"));
        assert!(!reg.is_allowed("pkg.module"));
    }

    #[tokio::test]
    async fn dispatch_echoes_through_handler() {
        let reg = ProxyRegistry::new(["pkg".to_string()], Arc::new(Echo), 4);
        match reg.dispatch(&payload("pkg.mod")).await {
            ProxyOutcome::Ok(bytes) => assert_eq!(&bytes[..], &[1, 2, 3]),
            ProxyOutcome::Err { reason, .. } => panic!("{reason}"),
        }
    }

    #[tokio::test]
    async fn dispatch_refuses_unlisted_module() {
        let reg = ProxyRegistry::new(["pkg".to_string()], Arc::new(Echo), 4);
        match reg.dispatch(&payload("secret.stuff")).await {
            ProxyOutcome::Err { kind, .. } => assert_eq!(kind, "refused"),
            ProxyOutcome::Ok(_) => panic!("should refuse"),
        }
    }
}
