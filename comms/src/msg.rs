use std::{borrow::Cow, fmt, io};

use crate::{
    Deserialize, Serialize,
    specs::{BatchHeader, Command, RemoteErr, VarMeta},
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_KIND: Header = 0;
const CONTROL_KIND: Header = 1;
const REQUEST_KIND: Header = 2;
const RESPONSE_KIND: Header = 3;

/// A set of variables travelling together, their metadata and their raw bytes.
///
/// The data blob holds every variable's bytes back to back, in the order of `header.vars`.
#[derive(Clone, PartialEq)]
pub struct VarBatch<'a> {
    pub header: BatchHeader,
    pub data: Cow<'a, [u8]>,
}

impl<'a> VarBatch<'a> {
    /// Creates a new `VarBatch`.
    ///
    /// # Arguments
    /// * `header` - The addressing metadata and the description of every variable.
    /// * `data` - The concatenated bytes of every variable.
    pub fn new(header: BatchHeader, data: impl Into<Cow<'a, [u8]>>) -> Self {
        Self {
            header,
            data: data.into(),
        }
    }

    /// Creates an acknowledgement for `header`, a batch without variables.
    pub fn ack(header: &BatchHeader) -> VarBatch<'static> {
        VarBatch::new(header.reply(), Vec::new())
    }

    /// Detaches the batch from the buffer it was received into.
    pub fn into_owned(self) -> VarBatch<'static> {
        VarBatch {
            header: self.header,
            data: Cow::Owned(self.data.into_owned()),
        }
    }

    /// Pairs every variable with its slice of the data blob.
    ///
    /// # Returns
    /// The pairs in wire order or an `InvalidData` error if the declared lengths
    /// don't add up to the length of the data blob.
    pub fn split_vars(&self) -> io::Result<Vec<(&VarMeta, &[u8])>> {
        let declared = self
            .header
            .vars
            .iter()
            .try_fold(0usize, |acc, meta| acc.checked_add(meta.len));

        if declared != Some(self.data.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "variables declare {declared:?} bytes but the batch carries {}",
                    self.data.len()
                ),
            ));
        }

        let mut rest: &[u8] = &self.data;
        let pairs = self
            .header
            .vars
            .iter()
            .map(|meta| {
                let (bytes, tail) = rest.split_at(meta.len);
                rest = tail;
                (meta, bytes)
            })
            .collect();

        Ok(pairs)
    }
}

impl fmt::Debug for VarBatch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VarBatch")
            .field("header", &self.header)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// The application layer message for the entire system.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg<'a> {
    Err(RemoteErr),
    Control(Command),
    Request(VarBatch<'a>),
    Response(VarBatch<'a>),
}

impl Msg<'_> {
    /// Detaches the message from the buffer it was received into.
    pub fn into_owned(self) -> Msg<'static> {
        match self {
            Msg::Err(e) => Msg::Err(e),
            Msg::Control(cmd) => Msg::Control(cmd),
            Msg::Request(batch) => Msg::Request(batch.into_owned()),
            Msg::Response(batch) => Msg::Response(batch.into_owned()),
        }
    }

    /// A short name of the variant, used for logging and error reporting.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Msg::Err(_) => "Err",
            Msg::Control(_) => "Control",
            Msg::Request(_) => "Request",
            Msg::Response(_) => "Response",
        }
    }

    fn buf_is_too_small<T>(size: usize, needed: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {needed} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind {kind}"),
        ))
    }
}

// Truncated JSON would otherwise surface as `UnexpectedEof`, which reads as a closed connection.
fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn serialize_batch<'a>(
    kind: Header,
    batch: &'a VarBatch<'_>,
    buf: &mut Vec<u8>,
) -> io::Result<Option<&'a [u8]>> {
    buf.extend_from_slice(&kind.to_be_bytes());

    let len_at = buf.len();
    buf.extend_from_slice(&[0; HEADER_SIZE]);
    serde_json::to_writer(&mut *buf, &batch.header)?;

    let header_len = (buf.len() - len_at - HEADER_SIZE) as Header;
    buf[len_at..len_at + HEADER_SIZE].copy_from_slice(&header_len.to_be_bytes());

    Ok(Some(batch.data.as_ref()))
}

fn deserialize_batch(buf: &[u8]) -> io::Result<VarBatch<'_>> {
    if buf.len() < HEADER_SIZE {
        return Msg::buf_is_too_small(buf.len(), HEADER_SIZE);
    }

    let (len_buf, rest) = buf.split_at(HEADER_SIZE);

    // SAFETY: We splitted the buffer to be of size `HEADER_SIZE` just above.
    let header_len = Header::from_be_bytes(len_buf.try_into().unwrap()) as usize;

    if rest.len() < header_len {
        return Msg::buf_is_too_small(buf.len(), HEADER_SIZE + header_len);
    }

    let (header, data) = rest.split_at(header_len);
    let header = serde_json::from_slice(header).map_err(invalid_data)?;
    Ok(VarBatch::new(header, data))
}

impl<'a> Serialize<'a> for Msg<'_> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_KIND.to_be_bytes());
                serde_json::to_writer(buf, e)?;
                Ok(None)
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_KIND.to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Msg::Request(batch) => serialize_batch(REQUEST_KIND, batch, buf),
            Msg::Response(batch) => serialize_batch(RESPONSE_KIND, batch, buf),
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len(), HEADER_SIZE);
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);

        // SAFETY: We splitted the buffer to be of size `HEADER_SIZE` just above.
        let kind = Header::from_be_bytes(kind_buf.try_into().unwrap());

        match kind {
            ERR_KIND => Ok(Self::Err(serde_json::from_slice(rest).map_err(invalid_data)?)),
            CONTROL_KIND => Ok(Self::Control(
                serde_json::from_slice(rest).map_err(invalid_data)?,
            )),
            REQUEST_KIND => Ok(Self::Request(deserialize_batch(rest)?)),
            RESPONSE_KIND => Ok(Self::Response(deserialize_batch(rest)?)),
            kind => Self::invalid_kind(kind),
        }
    }
}
