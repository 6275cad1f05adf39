//! Serialized object data.
//!
//! [`DataOStream`] buffers values, compresses them and sends them as a
//! sequence of data packets. On the receiving side an
//! [`ObjectDataIStream`] collects the packets of one version and hands out
//! [`DataIStream`] readers over them.

mod istream;
mod object_istream;
mod object_ostream;
mod ostream;

pub use istream::DataIStream;
pub use object_istream::ObjectDataIStream;
pub use object_ostream::ObjectSink;
pub use ostream::{CompressionState, DataOStream, DataPacket, DataSink, gather_connections};

#[cfg(test)]
pub(crate) use object_istream::tests::data_frames;
