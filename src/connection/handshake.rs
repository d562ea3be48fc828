//! Blocking connection setup exchange.

use bytes::BytesMut;

use crate::error::{Result, XwireError};
use crate::protocol::{
    decode_setup_response, encode_setup_request, AuthInfo, Setup, SetupResponseHeader,
    SETUP_RESPONSE_HEADER_SIZE,
};
use crate::transport::Stream;

/// Send the setup request and read the server's answer.
///
/// The stream must be in blocking mode.
pub(crate) fn handshake(stream: &Stream, auth: Option<&AuthInfo>) -> Result<Setup> {
    stream.write_all(&encode_setup_request(auth)?)?;

    let mut header = [0u8; SETUP_RESPONSE_HEADER_SIZE];
    stream.read_exact(&mut header)?;
    let decoded = SetupResponseHeader::decode(&header)
        .ok_or_else(|| XwireError::Protocol("short setup response".to_string()))?;

    let mut raw = BytesMut::with_capacity(SETUP_RESPONSE_HEADER_SIZE + decoded.body_len());
    raw.extend_from_slice(&header);
    raw.resize(SETUP_RESPONSE_HEADER_SIZE + decoded.body_len(), 0);
    stream.read_exact(&mut raw[SETUP_RESPONSE_HEADER_SIZE..])?;

    let setup = decode_setup_response(raw.freeze())?;
    tracing::debug!(
        "Connected to {} (protocol {}.{}, release {})",
        setup.vendor,
        setup.protocol_major_version,
        setup.protocol_minor_version,
        setup.release_number
    );
    Ok(setup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{success_response, STATUS_FAILED};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::thread;

    #[test]
    fn test_handshake_success() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let peer = thread::spawn(move || {
            let mut request = [0u8; 12];
            server.read_exact(&mut request).unwrap();
            server
                .write_all(&success_response(0x0020_0000, 0x001F_FFFF, 65535, "test"))
                .unwrap();
            request
        });

        let setup = handshake(&Stream::from(client), None).unwrap();
        assert_eq!(setup.resource_id_base, 0x0020_0000);
        assert_eq!(setup.vendor, "test");

        let request = peer.join().unwrap();
        assert_eq!(u16::from_ne_bytes([request[2], request[3]]), 11);
    }

    #[test]
    fn test_handshake_refused() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let peer = thread::spawn(move || {
            let mut request = [0u8; 12];
            server.read_exact(&mut request).unwrap();
            let mut response = vec![STATUS_FAILED, 4, 11, 0, 0, 0];
            response.extend_from_slice(&1u16.to_ne_bytes());
            response.extend_from_slice(b"nope");
            server.write_all(&response).unwrap();
        });

        let result = handshake(&Stream::from(client), None);
        assert!(matches!(result, Err(XwireError::SetupFailed { ref reason }) if reason == "nope"));
        peer.join().unwrap();
    }

    #[test]
    fn test_handshake_eof() {
        let (client, server) = UnixStream::pair().unwrap();
        drop(server);
        assert!(handshake(&Stream::from(client), None).is_err());
    }
}
