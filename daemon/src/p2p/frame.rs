use super::error::P2pError;
use crate::config::{
    FRAME_HEADER_SIZE, FRAME_RESERVED, MAGIC_NUMBER, MAX_FRAME_DATA_SIZE, MESSAGE_NAME_SIZE,
};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

// One parsed frame: the decoded message name and its payload. The
// payload checksum is kept around for relay deduplication.
//
//  0               1               2               3              (bytes)
// +---------------------------------------------------------------+
// |                         Magic Number                          |
// +---------------------------------------------------------------+
// |                         Chain ID                              |
// +-----------------------------------------------+---------------+
// |                         Reserved              |   Version     |
// +-----------------------------------------------+---------------+
// |                         Message Name (12)                     |
// +---------------------------------------------------------------+
// |                         Data Length                           |
// +---------------------------------------------------------------+
// |                         Data Checksum                         |
// +---------------------------------------------------------------+
// |                         Header Checksum                       |
// +---------------------------------------------------------------+
// |                         Data ...                              |
// +---------------------------------------------------------------+
#[derive(Debug)]
pub struct Frame {
    pub name: String,
    pub data: Bytes,
    pub data_checksum: u32,
}

// Frame a payload for the wire
pub fn build_frame(
    chain_id: u32,
    version: u8,
    name: &str,
    data: &[u8],
) -> Result<Bytes, P2pError> {
    if name.is_empty() || name.len() > MESSAGE_NAME_SIZE || !name.bytes().all(|b| b.is_ascii() && b != 0) {
        return Err(P2pError::InvalidMessageName);
    }
    if data.len() > MAX_FRAME_DATA_SIZE as usize {
        return Err(P2pError::FrameTooLarge(data.len() as u32));
    }

    let mut header = [0u8; FRAME_HEADER_SIZE - 4];
    header[0..4].copy_from_slice(&MAGIC_NUMBER);
    header[4..8].copy_from_slice(&chain_id.to_be_bytes());
    header[8..11].copy_from_slice(&FRAME_RESERVED);
    header[11] = version;
    header[12..12 + name.len()].copy_from_slice(name.as_bytes());
    header[24..28].copy_from_slice(&(data.len() as u32).to_be_bytes());
    header[28..32].copy_from_slice(&crc32fast::hash(data).to_be_bytes());
    let header_checksum = crc32fast::hash(&header);

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + data.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&header_checksum.to_be_bytes());
    frame.extend_from_slice(data);
    Ok(Bytes::from(frame))
}

// Read one frame off the stream. Every validation failure closes the
// stream on the caller's side, so no partial parsing survives.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    chain_id: u32,
    version: u8,
) -> Result<Frame, P2pError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    if header[0..4] != MAGIC_NUMBER {
        return Err(P2pError::InvalidMagicNumber);
    }
    let frame_chain_id = u32::from_be_bytes(header[4..8].try_into().unwrap());
    if frame_chain_id != chain_id {
        return Err(P2pError::InvalidChainId {
            expected: chain_id,
            got: frame_chain_id,
        });
    }
    if header[11] != version {
        return Err(P2pError::InvalidVersion {
            expected: version,
            got: header[11],
        });
    }
    let header_checksum = u32::from_be_bytes(header[32..36].try_into().unwrap());
    if crc32fast::hash(&header[..32]) != header_checksum {
        return Err(P2pError::InvalidHeaderChecksum);
    }

    let data_length = u32::from_be_bytes(header[24..28].try_into().unwrap());
    if data_length > MAX_FRAME_DATA_SIZE {
        return Err(P2pError::FrameTooLarge(data_length));
    }
    let data_checksum = u32::from_be_bytes(header[28..32].try_into().unwrap());

    let mut data = vec![0u8; data_length as usize];
    reader.read_exact(&mut data).await?;
    if crc32fast::hash(&data) != data_checksum {
        return Err(P2pError::InvalidDataChecksum);
    }

    let name_field = &header[12..12 + MESSAGE_NAME_SIZE];
    let name_bytes = match name_field.iter().position(|b| *b == 0) {
        Some(index) => &name_field[..index],
        None => name_field,
    };
    if name_bytes.is_empty() || !name_bytes.iter().all(|b| b.is_ascii()) {
        return Err(P2pError::InvalidMessageName);
    }
    let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| P2pError::InvalidMessageName)?;

    Ok(Frame {
        name,
        data: Bytes::from(data),
        data_checksum,
    })
}
