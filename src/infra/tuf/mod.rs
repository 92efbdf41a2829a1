//! TUF (The Update Framework) metadata client used to distribute policy.

mod client;
mod roots;
mod transport;

pub use client::{write_atomic, TufClient, TufClientOptions};
pub use roots::embedded_root;
pub use transport::{transport_for, HttpTransport, MetadataTransport, OciTransport};
