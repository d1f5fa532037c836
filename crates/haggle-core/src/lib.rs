//! Data model, attribute algebra, and content addressing for the Haggle
//! daemon: the pieces shared by every manager and by the wire protocol,
//! with no I/O and no async runtime of their own.

pub mod attribute;
pub mod bloomfilter;
pub mod canonical;
pub mod certificate;
pub mod dataobject;
pub mod error;
pub mod interface;
pub mod metadata;
pub mod node;

pub use attribute::{Attribute, AttributeSet};
pub use bloomfilter::{Bloomfilter, BloomfilterParams, CountingBloomfilter};
pub use certificate::{Certificate, CertificateAuthority};
pub use dataobject::{Bookkeeping, DataObject, Payload, SignatureStatus};
pub use error::{Error, Result};
pub use interface::{Interface, InterfaceStatus, InterfaceType};
pub use metadata::{Metadata, MetadataCodec, PostcardCodec};
pub use node::{Node, NodeType};
