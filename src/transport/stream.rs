use crate::{
    transport::connection::{KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
    Result,
};
use bytes::{Buf, BytesMut};
use rsip::SipMessage;
use tokio_util::codec::{Decoder, Encoder};

const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Frame codec for stream transports.
///
/// A SIP message on a stream ends at the double CRLF closing the headers
/// plus `Content-Length` bytes of body; partial frames stay buffered until
/// the boundary is seen. CRLF keepalive probes are surfaced as
/// `Error::Keepalive` so the connection can answer them without involving
/// the parser.
pub struct SipCodec {
    max_size: usize,
}

impl SipCodec {
    pub fn new() -> Self {
        Self {
            max_size: MAX_SIP_MESSAGE_SIZE,
        }
    }
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn content_length_of(headers: &str) -> usize {
    for line in headers.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
            return value.trim().parse().unwrap_or(0);
        }
    }
    0
}

impl Decoder for SipCodec {
    type Item = SipMessage;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() >= 4 && &src[0..4] == KEEPALIVE_REQUEST {
            src.advance(4);
            return Err(crate::Error::Keepalive);
        }
        if src.len() >= 2 && &src[0..2] == KEEPALIVE_RESPONSE {
            src.advance(2);
            return Err(crate::Error::Keepalive);
        }

        let data = match std::str::from_utf8(&src[..]) {
            Ok(s) => s,
            Err(_) => {
                if src.len() > self.max_size {
                    return Err(crate::Error::Error("SIP message too large".to_string()));
                }
                return Ok(None);
            }
        };

        let Some(header_end) = data.find("\r\n\r\n") else {
            if src.len() > self.max_size {
                return Err(crate::Error::Error("SIP message too large".to_string()));
            }
            return Ok(None);
        };

        let body_len = content_length_of(&data[..header_end]);
        let total = header_end + 4 + body_len;
        if src.len() < total {
            // headers complete, body still in flight
            return Ok(None);
        }

        match SipMessage::try_from(&data[..total]) {
            Ok(msg) => {
                src.advance(total);
                Ok(Some(msg))
            }
            Err(e) => {
                src.advance(total);
                Err(crate::Error::Error(format!(
                    "failed to parse SIP message: {}",
                    e
                )))
            }
        }
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        let data = item.to_string();
        dst.extend_from_slice(data.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &str = "REGISTER sip:3402000000@127.0.0.1 SIP/2.0\r\n\
        Via: SIP/2.0/TCP 127.0.0.1:5062;branch=z9hG4bKtest\r\n\
        From: <sip:34020000001320000001@3402000000>;tag=abc\r\n\
        To: <sip:34020000001320000001@3402000000>\r\n\
        Call-ID: test@127.0.0.1\r\n\
        CSeq: 1 REGISTER\r\n\
        Max-Forwards: 70\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_decode_partial_then_full() {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::new();

        let (head, tail) = REGISTER.split_at(40);
        buf.extend_from_slice(head.as_bytes());
        assert!(matches!(codec.decode(&mut buf), Ok(None)));

        buf.extend_from_slice(tail.as_bytes());
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert!(msg.is_request());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_waits_for_body() {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::new();

        let msg = "MESSAGE sip:34020000002000000001@3402000000 SIP/2.0\r\n\
            Via: SIP/2.0/TCP 127.0.0.1:5062;branch=z9hG4bKmsg\r\n\
            From: <sip:34020000001320000001@3402000000>;tag=abc\r\n\
            To: <sip:34020000002000000001@3402000000>\r\n\
            Call-ID: body@127.0.0.1\r\n\
            CSeq: 2 MESSAGE\r\n\
            Content-Type: Application/MANSCDP+xml\r\n\
            Content-Length: 10\r\n\r\n0123456789";

        // everything except the last body byte: no frame yet
        buf.extend_from_slice(&msg.as_bytes()[..msg.len() - 1]);
        assert!(matches!(codec.decode(&mut buf), Ok(None)));

        buf.extend_from_slice(&msg.as_bytes()[msg.len() - 1..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            SipMessage::Request(req) => assert_eq!(req.body.len(), 10),
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn test_keepalive_probe() {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(KEEPALIVE_REQUEST);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(crate::Error::Keepalive)
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_two_messages_in_one_read() {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(REGISTER.as_bytes());
        buf.extend_from_slice(REGISTER.as_bytes());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
