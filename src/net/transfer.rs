//! Chunked file transfer with resume, per-chunk integrity and flow control.
//!
//! The sender walks the file sequentially per paired edge, one task per
//! (file, peer), hashing each chunk on the blocking pool. A control channel
//! lets the receiver rewind it (`file_resume_from`), pause it
//! (`flow_pause`/`flow_resume`) or abort it. The receiver appends to a
//! `<name>.part` file, buffers a bounded window of out-of-order chunks, and
//! renames atomically once every index has landed.

use crate::net::envelope::{ChunkData, Command, Envelope, FileChunkPayload};
use crate::net::node::{Node, NodeError};
use crate::net::serde_safe::MAX_CHUNK_BYTES;
use crate::net::types::{CHUNK_RETRY_LIMIT, FILE_SWEEP_INTERVAL_SECS, OUT_OF_ORDER_CHUNK_BUDGET};
use crate::types::Address;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handed to the `file_handling_callback` when an inbound file completes.
#[derive(Debug, Clone)]
pub struct FileDelivery {
    pub filename: String,
    pub size: u64,
    pub source: Address,
    pub topic: String,
    pub path: PathBuf,
}

/// Messages routed from the dispatcher to a sender task.
#[derive(Debug, Clone)]
pub(crate) enum TransferControl {
    ResumeFrom(u64),
    Pause,
    Resume,
    Abort,
}

// =============================================================================
// SENDER
// =============================================================================

struct SenderJob {
    file_id: Uuid,
    peer: Address,
    topic: String,
    path: PathBuf,
    filename: String,
    size: u64,
    chunk_size: u32,
    total_chunks: u64,
}

/// Stream a file to every peer paired on `topic`. Returns the transfer id;
/// chunks flow in the background, one sequential task per edge.
pub(crate) async fn push_file(
    node: &Arc<Node>,
    topic: &str,
    path: &Path,
) -> Result<Uuid, NodeError> {
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_file() {
        return Err(NodeError::Transfer(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| NodeError::Transfer("file name is not valid UTF-8".to_string()))?
        .to_string();

    let peers = node.pairings().peers(topic);
    if peers.is_empty() {
        return Err(NodeError::NoPairedPeers(topic.to_string()));
    }

    let size = meta.len();
    let chunk_size = node.config().chunk_size.clamp(1, MAX_CHUNK_BYTES as u32);
    let total_chunks = size.div_ceil(chunk_size as u64).max(1);
    let file_id = Uuid::new_v4();

    for peer in peers {
        let Some(sender) = node.sender_for(&peer) else {
            continue;
        };
        let job = SenderJob {
            file_id,
            peer: peer.clone(),
            topic: topic.to_string(),
            path: path.to_path_buf(),
            filename: filename.clone(),
            size,
            chunk_size,
            total_chunks,
        };
        let (ctl_tx, ctl_rx) = mpsc::channel(16);
        node.register_outbound_transfer(file_id, &peer, ctl_tx);

        let task_node = node.clone();
        let handle = tokio::spawn(async move {
            run_sender(task_node, job, sender, ctl_rx).await;
        });
        node.track_task(handle);
    }

    info!(
        "file transfer {} started: {} ({} bytes, {} chunks)",
        file_id, filename, size, total_chunks
    );
    Ok(file_id)
}

async fn run_sender(
    node: Arc<Node>,
    job: SenderJob,
    sender: mpsc::Sender<Envelope>,
    mut ctl: mpsc::Receiver<TransferControl>,
) {
    if let Err(reason) = sender_loop(&node, &job, &sender, &mut ctl).await {
        warn!(
            "file transfer {} to {} failed: {}",
            job.file_id, job.peer, reason
        );
        let env = Envelope::new(
            node.address().clone(),
            Command::FileTransferFailed {
                file_id: job.file_id,
                reason,
            },
        )
        .with_topic(&job.topic);
        let _ = sender.send(env).await;
    }
    node.unregister_outbound_transfer(job.file_id, &job.peer);
}

enum Applied {
    Continue,
    Stop,
}

fn apply_control(index: &mut u64, paused: &mut bool, total: u64, ctl: TransferControl) -> Applied {
    match ctl {
        TransferControl::ResumeFrom(i) => {
            *index = i.min(total);
            Applied::Continue
        }
        TransferControl::Pause => {
            *paused = true;
            Applied::Continue
        }
        TransferControl::Resume => {
            *paused = false;
            Applied::Continue
        }
        TransferControl::Abort => Applied::Stop,
    }
}

async fn sender_loop(
    node: &Arc<Node>,
    job: &SenderJob,
    sender: &mpsc::Sender<Envelope>,
    ctl: &mut mpsc::Receiver<TransferControl>,
) -> Result<(), String> {
    let mut file = File::open(&job.path).await.map_err(|e| e.to_string())?;
    let mut index = 0u64;
    let mut paused = false;

    loop {
        while index < job.total_chunks {
            // Drain control before each chunk so rewinds apply promptly.
            loop {
                match ctl.try_recv() {
                    Ok(c) => {
                        if let Applied::Stop = apply_control(&mut index, &mut paused, job.total_chunks, c) {
                            return Ok(());
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
                }
            }

            if paused {
                match ctl.recv().await {
                    Some(c) => {
                        if let Applied::Stop = apply_control(&mut index, &mut paused, job.total_chunks, c) {
                            return Ok(());
                        }
                        continue;
                    }
                    None => return Ok(()),
                }
            }

            let offset = index * job.chunk_size as u64;
            let want = (job.size - offset).min(job.chunk_size as u64) as usize;
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| e.to_string())?;
            let mut buf = vec![0u8; want];
            file.read_exact(&mut buf).await.map_err(|e| e.to_string())?;

            // Hash on the blocking pool; chunk sizes are configurable and
            // may exceed the scheduler budget.
            let (buf, sha256) = tokio::task::spawn_blocking(move || {
                let digest: [u8; 32] = Sha256::digest(&buf).into();
                (buf, digest)
            })
            .await
            .map_err(|e| e.to_string())?;

            let payload = FileChunkPayload {
                file_id: job.file_id,
                filename: job.filename.clone(),
                index,
                total_chunks: job.total_chunks,
                chunk_size: job.chunk_size,
                size: job.size,
                sha256,
                eof: index + 1 == job.total_chunks,
                data: ChunkData::new(buf).ok_or("chunk exceeds wire limit")?,
            };
            let env = Envelope::new(node.address().clone(), Command::FileChunk(payload))
                .with_topic(&job.topic);
            if sender.send(env).await.is_err() {
                // Edge gone; the receiver resumes from its .part later.
                return Ok(());
            }
            index += 1;
        }

        // All chunks submitted. Linger so a late resume or integrity
        // re-request can rewind us, then retire.
        match tokio::time::timeout(node.config().file_idle_timeout, ctl.recv()).await {
            Ok(Some(TransferControl::ResumeFrom(i))) if i < job.total_chunks => {
                debug!("file transfer {} rewound to chunk {}", job.file_id, i);
                index = i;
            }
            Ok(Some(TransferControl::Abort)) | Ok(None) | Err(_) => return Ok(()),
            Ok(Some(_)) => {}
        }
    }
}

// =============================================================================
// RECEIVER
// =============================================================================

/// What the dispatcher should do after a chunk was accepted.
#[derive(Debug, Default)]
pub(crate) struct ChunkActions {
    pub resume_request: Option<u64>,
    pub pause: bool,
    pub resume_flow: bool,
    pub completed: bool,
    pub failed: Option<String>,
}

pub(crate) struct FileRecord {
    pub source: Address,
    pub topic: String,
    pub filename: String,
    size: u64,
    chunk_size: u32,
    total_chunks: u64,
    next_index: u64,
    pending: BTreeMap<u64, Vec<u8>>,
    buffered_bytes: u64,
    file: File,
    part_path: PathBuf,
    final_path: PathBuf,
    marker_path: PathBuf,
    retries: u8,
    pub last_chunk: Instant,
    paused: bool,
}

/// The wire filename is untrusted; keep only its final component.
pub(crate) fn basename(raw: &str) -> Option<String> {
    Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

impl FileRecord {
    /// Open (or reopen) the `.part` file for an incoming transfer. Returns
    /// the record plus the resume index to report, when the sender should
    /// realign.
    ///
    /// Resume identity is (source, filename): a `<name>.part.src` marker
    /// records which sender a partial belongs to, and a partial left by a
    /// different sender is truncated rather than continued.
    pub(crate) async fn open(
        destination: &Path,
        source: Address,
        topic: String,
        chunk: &FileChunkPayload,
    ) -> std::io::Result<(Self, Option<u64>)> {
        if chunk.chunk_size == 0
            || chunk.total_chunks != chunk.size.div_ceil(chunk.chunk_size as u64).max(1)
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "inconsistent chunk geometry",
            ));
        }
        let filename = basename(&chunk.filename).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "unusable file name")
        })?;

        tokio::fs::create_dir_all(destination).await?;
        let part_path = destination.join(format!("{filename}.part"));
        let final_path = destination.join(&filename);
        let marker_path = destination.join(format!("{filename}.part.src"));

        // A leftover .part resumes from its last complete chunk, but only
        // for the sender that wrote it; a marker mismatch (or no marker)
        // means the partial is someone else's bytes and must not be
        // spliced into this transfer.
        let same_source = match tokio::fs::read_to_string(&marker_path).await {
            Ok(recorded) => recorded.trim() == source.to_string(),
            Err(_) => false,
        };
        let resume_index = if same_source {
            match tokio::fs::metadata(&part_path).await {
                Ok(meta) => meta.len() / chunk.chunk_size as u64,
                Err(_) => 0,
            }
        } else {
            0
        };
        let resume_offset = resume_index * chunk.chunk_size as u64;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&part_path)
            .await?;
        file.set_len(resume_offset).await?;
        let mut file = file;
        file.seek(SeekFrom::Start(resume_offset)).await?;
        tokio::fs::write(&marker_path, source.to_string()).await?;

        let report = (resume_index > 0 || chunk.index != resume_index).then_some(resume_index);
        Ok((
            Self {
                source,
                topic,
                filename,
                size: chunk.size,
                chunk_size: chunk.chunk_size,
                total_chunks: chunk.total_chunks,
                next_index: resume_index,
                pending: BTreeMap::new(),
                buffered_bytes: 0,
                file,
                part_path,
                final_path,
                marker_path,
                retries: 0,
                last_chunk: Instant::now(),
                paused: false,
            },
            report,
        ))
    }

    /// Accept one chunk: verify, append or buffer, drain, finalize.
    pub(crate) async fn accept(&mut self, chunk: &FileChunkPayload) -> ChunkActions {
        let mut actions = ChunkActions::default();
        self.last_chunk = Instant::now();

        if chunk.index >= self.total_chunks {
            actions.failed = Some(format!("chunk index {} out of range", chunk.index));
            return actions;
        }
        if chunk.index < self.next_index {
            return actions; // duplicate of an already-written chunk
        }

        let digest: [u8; 32] = Sha256::digest(&chunk.data[..]).into();
        if digest != chunk.sha256 {
            debug!(
                "chunk {} digest {} does not match announced {}",
                chunk.index,
                hex::encode(&digest[..8]),
                hex::encode(&chunk.sha256[..8])
            );
            self.retries += 1;
            if self.retries > CHUNK_RETRY_LIMIT {
                actions.failed = Some(format!(
                    "chunk {} failed integrity after {} retries",
                    chunk.index, CHUNK_RETRY_LIMIT
                ));
            } else {
                actions.resume_request = Some(chunk.index);
            }
            return actions;
        }

        if chunk.index == self.next_index {
            if let Err(e) = self.append(&chunk.data).await {
                actions.failed = Some(e.to_string());
                return actions;
            }
            self.next_index += 1;

            // Drain the buffered window.
            while let Some(data) = self.pending.remove(&self.next_index) {
                self.buffered_bytes = self.buffered_bytes.saturating_sub(data.len() as u64);
                if let Err(e) = self.append(&data).await {
                    actions.failed = Some(e.to_string());
                    return actions;
                }
                self.next_index += 1;
            }
            if self.paused && self.pending.is_empty() {
                self.paused = false;
                actions.resume_flow = true;
            }
        } else {
            // Out of order: buffer within budget.
            if !self.pending.contains_key(&chunk.index) {
                self.buffered_bytes += chunk.data.len() as u64;
                self.pending.insert(chunk.index, chunk.data.to_vec());
            }
            let budget = OUT_OF_ORDER_CHUNK_BUDGET * self.chunk_size as u64;
            if self.buffered_bytes > budget && !self.paused {
                self.paused = true;
                actions.pause = true;
            }
        }

        if self.next_index >= self.total_chunks {
            match self.finalize().await {
                Ok(()) => actions.completed = true,
                Err(e) => actions.failed = Some(e.to_string()),
            }
        }
        actions
    }

    async fn append(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data).await
    }

    /// Flush, then atomically rename `<name>.part` to `<name>`.
    async fn finalize(&mut self) -> std::io::Result<()> {
        self.file.sync_all().await?;
        tokio::fs::rename(&self.part_path, &self.final_path).await?;
        let _ = tokio::fs::remove_file(&self.marker_path).await;
        Ok(())
    }

    pub(crate) fn delivery(&self) -> FileDelivery {
        FileDelivery {
            filename: self.filename.clone(),
            size: self.size,
            source: self.source.clone(),
            topic: self.topic.clone(),
            path: self.final_path.clone(),
        }
    }
}

/// Dispatcher entry for `file_chunk`.
pub(crate) async fn handle_chunk(node: &Arc<Node>, from: &Address, env: &Envelope) {
    let Command::FileChunk(chunk) = &env.command else {
        return;
    };
    let topic = env.topic.clone().unwrap_or_default();

    let mut table = node.transfers_in().lock().await;
    if !table.contains_key(&chunk.file_id) {
        // Active records are keyed by (source, filename) too: a sender
        // restarting under a fresh file_id supersedes its own record,
        // while another sender aiming at the same filename must not share
        // its .part.
        if let Some(name) = basename(&chunk.filename) {
            let clash = table.iter().find_map(|(id, record)| {
                (record.filename == name).then(|| (*id, record.source == env.origin))
            });
            match clash {
                Some((old_id, true)) => {
                    debug!(
                        "file transfer {} supersedes {} for {}",
                        chunk.file_id, old_id, name
                    );
                    table.remove(&old_id);
                }
                Some((_, false)) => {
                    drop(table);
                    let reply = Envelope::new(
                        node.address().clone(),
                        Command::FileBusy {
                            file_id: chunk.file_id,
                        },
                    );
                    let _ = node.send_to(from, reply).await;
                    return;
                }
                None => {}
            }
        }
        if table.len() >= node.config().max_concurrent_files {
            drop(table);
            let reply = Envelope::new(
                node.address().clone(),
                Command::FileBusy {
                    file_id: chunk.file_id,
                },
            );
            let _ = node.send_to(from, reply).await;
            return;
        }
        let destination = node.config().destination_folder.clone();
        match FileRecord::open(&destination, env.origin.clone(), topic, chunk).await {
            Ok((record, resume_from)) => {
                debug!(
                    "file transfer {} inbound: {} from {}",
                    chunk.file_id, record.filename, env.origin
                );
                table.insert(chunk.file_id, record);
                if let Some(index) = resume_from {
                    drop(table);
                    info!(
                        "resuming file transfer {} from chunk {}",
                        chunk.file_id, index
                    );
                    let reply = Envelope::new(
                        node.address().clone(),
                        Command::FileResumeFrom {
                            file_id: chunk.file_id,
                            index,
                        },
                    );
                    let _ = node.send_to(from, reply).await;
                    table = node.transfers_in().lock().await;
                }
            }
            Err(e) => {
                drop(table);
                warn!("rejecting file transfer {}: {}", chunk.file_id, e);
                let reply = Envelope::new(
                    node.address().clone(),
                    Command::FileTransferFailed {
                        file_id: chunk.file_id,
                        reason: e.to_string(),
                    },
                );
                let _ = node.send_to(from, reply).await;
                return;
            }
        }
    }

    let Some(record) = table.get_mut(&chunk.file_id) else {
        return;
    };
    let actions = record.accept(chunk).await;

    let mut delivery = None;
    if actions.completed {
        if let Some(record) = table.remove(&chunk.file_id) {
            delivery = Some(record.delivery());
        }
    } else if actions.failed.is_some() {
        table.remove(&chunk.file_id);
    }
    drop(table);

    if let Some(index) = actions.resume_request {
        let reply = Envelope::new(
            node.address().clone(),
            Command::FileResumeFrom {
                file_id: chunk.file_id,
                index,
            },
        );
        let _ = node.send_to(from, reply).await;
    }
    if actions.pause {
        let reply = Envelope::new(
            node.address().clone(),
            Command::FlowPause {
                file_id: chunk.file_id,
            },
        );
        let _ = node.send_to(from, reply).await;
    }
    if actions.resume_flow {
        let reply = Envelope::new(
            node.address().clone(),
            Command::FlowResume {
                file_id: chunk.file_id,
            },
        );
        let _ = node.send_to(from, reply).await;
    }
    if let Some(reason) = actions.failed {
        warn!("file transfer {} aborted: {}", chunk.file_id, reason);
        let reply = Envelope::new(
            node.address().clone(),
            Command::FileTransferFailed {
                file_id: chunk.file_id,
                reason,
            },
        );
        let _ = node.send_to(from, reply).await;
    }
    if let Some(delivery) = delivery {
        info!(
            "file transfer {} complete: {} ({} bytes) from {}",
            chunk.file_id, delivery.filename, delivery.size, delivery.source
        );
        if let Some(callback) = node.config().file_handling_callback.clone() {
            callback(delivery);
        }
    }
}

/// Route a sender-directed control command to its transfer task.
pub(crate) fn on_sender_control(node: &Node, from: &Address, file_id: Uuid, ctl: TransferControl) {
    if let Some(tx) = node.outbound_transfer(file_id, from) {
        let _ = tx.try_send(ctl);
    }
}

/// Drop a failed inbound transfer, keeping its `.part` for a later resume.
pub(crate) async fn drop_inbound(node: &Arc<Node>, file_id: Uuid, reason: &str) {
    let mut table = node.transfers_in().lock().await;
    if table.remove(&file_id).is_some() {
        warn!("inbound file transfer {} dropped: {}", file_id, reason);
    }
}

/// Expire inbound records that stopped receiving chunks.
pub(crate) async fn run_sweeper(node: Arc<Node>) {
    let mut shutdown = node.shutdown_rx();
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(FILE_SWEEP_INTERVAL_SECS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let idle = node.config().file_idle_timeout;
                let mut table = node.transfers_in().lock().await;
                table.retain(|id, record| {
                    if record.last_chunk.elapsed() > idle {
                        warn!("file transfer {} idle, dropping (.part kept)", id);
                        false
                    } else {
                        true
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeClass;

    fn chunk(file_id: Uuid, index: u64, data: &[u8], size: u64, chunk_size: u32) -> FileChunkPayload {
        let total_chunks = size.div_ceil(chunk_size as u64).max(1);
        FileChunkPayload {
            file_id,
            filename: "data.bin".to_string(),
            index,
            total_chunks,
            chunk_size,
            size,
            sha256: Sha256::digest(data).into(),
            eof: index + 1 == total_chunks,
            data: ChunkData::new(data.to_vec()).unwrap(),
        }
    }

    fn source() -> Address {
        Address::new(NodeClass::Streamer, "127.0.0.1", 65431)
    }

    #[tokio::test]
    async fn in_order_chunks_complete_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let payload: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();

        let first = chunk(id, 0, &payload[..1024], 2048, 1024);
        let (mut record, resume) =
            FileRecord::open(dir.path(), source(), "t".into(), &first).await.unwrap();
        assert!(resume.is_none());

        let actions = record.accept(&first).await;
        assert!(!actions.completed);

        let second = chunk(id, 1, &payload[1024..], 2048, 1024);
        let actions = record.accept(&second).await;
        assert!(actions.completed);

        let written = std::fs::read(dir.path().join("data.bin")).unwrap();
        assert_eq!(written, payload);
        assert!(!dir.path().join("data.bin.part").exists());
    }

    #[tokio::test]
    async fn out_of_order_chunks_are_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let payload: Vec<u8> = (0..3072u32).map(|i| (i % 239) as u8).collect();

        let c0 = chunk(id, 0, &payload[..1024], 3072, 1024);
        let c1 = chunk(id, 1, &payload[1024..2048], 3072, 1024);
        let c2 = chunk(id, 2, &payload[2048..], 3072, 1024);

        let (mut record, _) =
            FileRecord::open(dir.path(), source(), "t".into(), &c0).await.unwrap();
        record.accept(&c0).await;
        // Chunk 2 before chunk 1.
        let actions = record.accept(&c2).await;
        assert!(!actions.completed);
        let actions = record.accept(&c1).await;
        assert!(actions.completed);

        assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), payload);
    }

    #[tokio::test]
    async fn existing_part_reports_resume_index() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 233) as u8).collect();

        // 1.5 chunks already on disk from the same sender; resume
        // truncates to the boundary.
        std::fs::write(dir.path().join("data.bin.part"), &payload[..1536]).unwrap();
        std::fs::write(dir.path().join("data.bin.part.src"), source().to_string()).unwrap();

        let c0 = chunk(id, 0, &payload[..1024], 4096, 1024);
        let (mut record, resume) =
            FileRecord::open(dir.path(), source(), "t".into(), &c0).await.unwrap();
        assert_eq!(resume, Some(1));
        assert_eq!(
            std::fs::metadata(dir.path().join("data.bin.part")).unwrap().len(),
            1024
        );

        for index in 1..4 {
            let c = chunk(
                id,
                index,
                &payload[(index as usize) * 1024..(index as usize + 1) * 1024],
                4096,
                1024,
            );
            let actions = record.accept(&c).await;
            assert_eq!(actions.completed, index == 3);
        }
        assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), payload);
    }

    #[tokio::test]
    async fn partial_from_another_source_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let payload: Vec<u8> = (0..2048u32).map(|i| (i % 241) as u8).collect();

        // A dead transfer from an unrelated sender left its bytes behind.
        std::fs::write(dir.path().join("data.bin.part"), vec![0xAA; 1536]).unwrap();
        std::fs::write(
            dir.path().join("data.bin.part.src"),
            "ChaskiStreamer@10.0.0.9:1",
        )
        .unwrap();

        let c0 = chunk(id, 0, &payload[..1024], 2048, 1024);
        let (mut record, resume) =
            FileRecord::open(dir.path(), source(), "t".into(), &c0).await.unwrap();
        // Not our partial: no resume offer, file truncated, marker retaken.
        assert_eq!(resume, None);
        assert_eq!(
            std::fs::metadata(dir.path().join("data.bin.part")).unwrap().len(),
            0
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("data.bin.part.src")).unwrap(),
            source().to_string()
        );

        record.accept(&c0).await;
        let c1 = chunk(id, 1, &payload[1024..], 2048, 1024);
        let actions = record.accept(&c1).await;
        assert!(actions.completed);
        assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), payload);
        assert!(!dir.path().join("data.bin.part.src").exists());
    }

    #[tokio::test]
    async fn partial_without_marker_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let payload = vec![3u8; 1024];

        // A bare .part with no source marker cannot be attributed; never
        // resume into it.
        std::fs::write(dir.path().join("data.bin.part"), vec![0x55; 1024]).unwrap();

        let c0 = chunk(id, 0, &payload, 1024, 1024);
        let (_record, resume) =
            FileRecord::open(dir.path(), source(), "t".into(), &c0).await.unwrap();
        assert_eq!(resume, None);
        assert_eq!(
            std::fs::metadata(dir.path().join("data.bin.part")).unwrap().len(),
            0
        );
    }

    #[tokio::test]
    async fn corrupt_chunk_requests_retry_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let payload = vec![9u8; 1024];

        let mut bad = chunk(id, 0, &payload, 2048, 1024);
        bad.sha256 = [0u8; 32];

        let (mut record, _) =
            FileRecord::open(dir.path(), source(), "t".into(), &bad).await.unwrap();
        for _ in 0..CHUNK_RETRY_LIMIT {
            let actions = record.accept(&bad).await;
            assert_eq!(actions.resume_request, Some(0));
            assert!(actions.failed.is_none());
        }
        let actions = record.accept(&bad).await;
        assert!(actions.failed.is_some());
    }

    #[tokio::test]
    async fn wire_filename_is_stripped_to_basename() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let payload = vec![1u8; 16];
        let mut c = chunk(id, 0, &payload, 16, 1024);
        c.filename = "../../etc/passwd".to_string();

        let (record, _) = FileRecord::open(dir.path(), source(), "t".into(), &c).await.unwrap();
        assert_eq!(record.filename, "passwd");
        assert!(record.part_path.starts_with(dir.path()));
    }
}
