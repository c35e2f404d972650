pub mod ca;
pub mod net;
pub mod proxy;
pub mod tls;
pub mod types;

pub use ca::{CaConfig, CaError, CertificateAuthority};
pub use net::{
    Command, Envelope, FileDelivery, Node, NodeConfig, NodeError, Session, TopicMessage,
};
pub use proxy::{DenyAllHandler, ProxyHandler};
pub use tls::{TlsContext, TlsError};
pub use types::{parse_connect, Address, AddressParseError, NodeClass};
