//! Admin access to a running domain
//!
//! The `casual` driver talks to a domain through its inbound gateway: a
//! plain domain connection carrying service calls to the admin services the
//! managers advertise. Nothing here is privileged; the admin surface is
//! ordinary services.

use tokio::net::TcpStream;
use tracing::debug;

use crate::domain_types::{DomainId, DomainName, IpcId, Pid, ServiceName};
use crate::error::{CasualError, ErrorKind, Result};
use crate::message::gateway::{DomainConnectRequest, Identity, PROTOCOL_VERSIONS};
use crate::message::service::Call;
use crate::message::{Envelope, Message};
use crate::process::ProcessHandle;
use crate::transport::{Assembler, tcp};

/// A connection to a domain's inbound gateway
pub struct Remote {
    stream: TcpStream,
    assembler: Assembler,
    /// The connected peer domain
    pub domain: Identity,
}

impl Remote {
    /// Connects and performs the domain handshake
    ///
    /// # Errors
    ///
    /// Fails on connection trouble or a protocol version mismatch.
    pub async fn connect(address: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(address).await?;
        let mut assembler = Assembler::new();

        let identity = Identity {
            id: DomainId::generate(),
            name: DomainName::try_new("casual-admin")
                .unwrap_or_else(|_| unreachable!("static name is valid")),
        };
        let connect = Envelope::new(Message::GatewayDomainConnectRequest(DomainConnectRequest {
            domain: identity,
            versions: PROTOCOL_VERSIONS.to_vec(),
        }));
        tcp::send(&mut stream, &connect).await?;

        loop {
            match tcp::receive(&mut stream, &mut assembler).await? {
                Some(envelope) => {
                    if let Message::GatewayDomainConnectReply(reply) = envelope.message {
                        if reply.version == 0 {
                            return Err(CasualError::CommunicationUnavailable {
                                context: "no common protocol version".into(),
                            });
                        }
                        return Ok(Self {
                            stream,
                            assembler,
                            domain: reply.domain,
                        });
                    }
                }
                None => {
                    return Err(CasualError::CommunicationUnavailable {
                        context: "peer closed during handshake".into(),
                    });
                }
            }
        }
    }

    /// Calls a service in the connected domain
    ///
    /// # Errors
    ///
    /// Communication failures; call-level outcomes are the inner
    /// [`ErrorKind`].
    pub async fn call(
        &mut self,
        service: &ServiceName,
        payload: Vec<u8>,
    ) -> Result<std::result::Result<Vec<u8>, ErrorKind>> {
        let call = Envelope::new(Message::ServiceCall(Call {
            // rewritten by the inbound connection; only the correlation
            // matters end-to-end
            process: ProcessHandle::new(Pid::allocate(), IpcId::generate()),
            service: service.clone(),
            trid: None,
            no_reply: false,
            deadline: None,
            payload,
        }));
        let correlation = call.correlation;
        tcp::send(&mut self.stream, &call).await?;

        loop {
            match tcp::receive(&mut self.stream, &mut self.assembler).await? {
                Some(envelope) if envelope.correlation == correlation => {
                    match envelope.message {
                        Message::ServiceReply(reply) => {
                            return Ok(match reply.code {
                                None => Ok(reply.payload),
                                Some(kind) => Err(kind),
                            });
                        }
                        other => {
                            debug!(message_type = %other.message_type(),
                                "unexpected correlated message - action: discard");
                        }
                    }
                }
                Some(other) => {
                    debug!(message_type = %other.message.message_type(),
                        "uncorrelated message - action: discard");
                }
                None => {
                    return Err(CasualError::CommunicationUnavailable {
                        context: "peer closed before the reply".into(),
                    });
                }
            }
        }
    }
}
