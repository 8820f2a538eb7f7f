//! Transport framing over TCP
//!
//! Gateway traffic carries the same transport frames as the intra-domain
//! bus, each preceded by a 4-byte big-endian length prefix. Payloads use the
//! network codec; integers on the wire are big-endian fixed-width.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain_types::Correlation;
use crate::error::{CasualError, Result};
use crate::message::{Envelope, MessageType, codec};
use crate::transport::{Assembler, Transport, fragment};

/// Frame header: type + correlation + offset + total size
const HEADER_SIZE: usize = 8 + 16 + 8 + 8;

/// Upper bound for one framed transport; anything larger is a protocol error
const MAX_FRAME: usize = HEADER_SIZE + super::MAX_PAYLOAD;

fn encode_frame(frame: &Transport) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + HEADER_SIZE + frame.data.len());
    buf.put_u32((HEADER_SIZE + frame.data.len()) as u32);
    buf.put_u64(frame.message_type.value());
    buf.put_slice(Uuid::from(frame.correlation).as_bytes());
    buf.put_u64(frame.offset);
    buf.put_u64(frame.total_size);
    buf.put_slice(&frame.data);
    buf
}

fn decode_frame(mut buf: &[u8]) -> Result<Transport> {
    if buf.len() < HEADER_SIZE {
        return Err(CasualError::TransportProtocol {
            reason: format!("frame of {} bytes is shorter than the header", buf.len()),
        });
    }
    let message_type =
        MessageType::from_value(buf.get_u64()).map_err(|error| CasualError::TransportProtocol {
            reason: error.to_string(),
        })?;
    let mut id = [0u8; 16];
    buf.copy_to_slice(&mut id);
    let correlation = Correlation::new(Uuid::from_bytes(id));
    let offset = buf.get_u64();
    let total_size = buf.get_u64();
    Ok(Transport {
        message_type,
        correlation,
        offset,
        total_size,
        data: buf.to_vec(),
    })
}

/// Writes one logical message to the stream in the network layout
///
/// # Errors
///
/// Fails when the message has no network schema or the peer is gone; the
/// caller marks the connection lost on an IO error.
pub async fn send<W: AsyncWrite + Unpin>(stream: &mut W, envelope: &Envelope) -> Result<()> {
    let payload = codec::encode_network(envelope)?;
    for frame in fragment(
        envelope.message.message_type(),
        envelope.correlation,
        &payload,
    ) {
        stream.write_all(&encode_frame(&frame)).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Reads frames until a logical message completes.
///
/// Returns `Ok(None)` on a clean peer close between messages. A close in
/// the middle of a message, an oversized frame, or a reassembly conflict is
/// an error and the connection must be dropped, discarding partial
/// reassemblies.
///
/// # Errors
///
/// See above; also propagates IO failures.
pub async fn receive<R: AsyncRead + Unpin>(
    stream: &mut R,
    assembler: &mut Assembler,
) -> Result<Option<Envelope>> {
    loop {
        let mut length = [0u8; 4];
        match stream.read_exact(&mut length).await {
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
                if assembler.partial() > 0 {
                    assembler.clear();
                    return Err(CasualError::CommunicationUnavailable {
                        context: "peer closed mid-message".into(),
                    });
                }
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        }

        let length = u32::from_be_bytes(length) as usize;
        if length < HEADER_SIZE || length > MAX_FRAME {
            return Err(CasualError::TransportProtocol {
                reason: format!("frame length {length} outside [{HEADER_SIZE}, {MAX_FRAME}]"),
            });
        }

        let mut frame = vec![0u8; length];
        stream.read_exact(&mut frame).await.map_err(|error| {
            if error.kind() == std::io::ErrorKind::UnexpectedEof {
                CasualError::CommunicationUnavailable {
                    context: "peer closed mid-frame".into(),
                }
            } else {
                error.into()
            }
        })?;

        if let Some(complete) = assembler.insert(decode_frame(&frame)?)? {
            let envelope = codec::decode_network(&complete.payload)?;
            return Ok(Some(envelope));
        }
    }
}

/// What the reader half of a connection observed
#[derive(Debug)]
pub enum ReaderEvent {
    /// A complete logical message arrived
    Message(Envelope),
    /// The peer closed cleanly between messages
    Closed,
    /// The connection failed; partial reassemblies were dropped
    Failed(CasualError),
}

/// Drains a read half into a channel until close or failure.
///
/// Reads are not cancellation-safe, so connection loops consume decoded
/// messages from the returned channel instead of selecting on the socket.
pub fn spawn_reader<R>(mut reader: R) -> mpsc::Receiver<ReaderEvent>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut assembler = Assembler::new();
        loop {
            match receive(&mut reader, &mut assembler).await {
                Ok(Some(envelope)) => {
                    if tx.send(ReaderEvent::Message(envelope)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(ReaderEvent::Closed).await;
                    return;
                }
                Err(error) => {
                    let _ = tx.send(ReaderEvent::Failed(error)).await;
                    return;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{DomainId, DomainName};
    use crate::message::Message;
    use crate::message::gateway::{DomainConnectRequest, Identity, PROTOCOL_VERSIONS};
    use tokio::net::{TcpListener, TcpStream};

    fn connect_request() -> Envelope {
        Envelope::new(Message::GatewayDomainConnectRequest(DomainConnectRequest {
            domain: Identity {
                id: DomainId::generate(),
                name: DomainName::try_new("test-domain").expect("valid name"),
            },
            versions: PROTOCOL_VERSIONS.to_vec(),
        }))
    }

    #[tokio::test]
    async fn tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("binds");
        let address = listener.local_addr().expect("has address");

        let envelope = connect_request();
        let sent = envelope.clone();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(address).await.expect("connects");
            send(&mut stream, &sent).await.expect("sends");
        });

        let (mut stream, _) = listener.accept().await.expect("accepts");
        let mut assembler = Assembler::new();
        let received = receive(&mut stream, &mut assembler)
            .await
            .expect("receives")
            .expect("a message");
        assert_eq!(received, envelope);
        client.await.expect("client task");
    }

    #[tokio::test]
    async fn clean_close_yields_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("binds");
        let address = listener.local_addr().expect("has address");

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(address).await.expect("connects");
            drop(stream);
        });

        let (mut stream, _) = listener.accept().await.expect("accepts");
        let mut assembler = Assembler::new();
        let received = receive(&mut stream, &mut assembler).await.expect("no error");
        assert!(received.is_none());
        client.await.expect("client task");
    }
}
