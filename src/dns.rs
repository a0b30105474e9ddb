//! Resolution of hostnames this proxy impersonates on the LAN.
//!
//! The system resolver answers with our own address for the intercepted
//! mirror-list hosts, so they are looked up against an explicit server.

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use log::{debug, trace};
use tokio::net::UdpSocket;

use crate::error::ProxyCacheError;

/// Maximum DNS message size over UDP without EDNS.
const MAX_UDP_MESSAGE: usize = 512;

/// Issues a single `A` query for `host` and returns the first address answered.
///
/// No retries, no caching and no fallback to `AAAA`.
pub(crate) async fn resolve(
    host: &str,
    server: SocketAddr,
    timeout: Duration,
) -> Result<Ipv4Addr, ProxyCacheError> {
    let fail = |reason: String| ProxyCacheError::Resolve {
        host: host.to_owned(),
        server,
        reason,
    };

    let (id, request) = build_query(host)?;

    let bind_addr: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(server).await?;

    trace!("Querying DNS server {server} for A record of {host}");

    let exchange = async {
        socket.send(&request).await?;

        let mut buf = [0u8; MAX_UDP_MESSAGE];
        loop {
            let len = socket.recv(&mut buf).await?;
            let response = Message::from_vec(&buf[..len])?;
            /* Ignore stray datagrams not answering our query */
            if response.id() == id && response.message_type() == MessageType::Response {
                return Ok::<Message, ProxyCacheError>(response);
            }
            debug!(
                "Ignoring unrelated DNS message with id {} from {server}",
                response.id()
            );
        }
    };

    let response = match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => return Err(fail(err.to_string())),
        Err(_elapsed) => return Err(fail(format!("no answer within {timeout:?}"))),
    };

    first_a_record(&response).ok_or_else(|| {
        fail(format!(
            "no A record in answer (rcode {})",
            response.response_code()
        ))
    })
}

fn build_query(host: &str) -> Result<(u16, Vec<u8>), ProxyCacheError> {
    let name = Name::from_ascii(format!("{}.", host.trim_end_matches('.')))?;

    let id = rand::random::<u16>();

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));

    Ok((id, message.to_vec()?))
}

#[must_use]
fn first_a_record(message: &Message) -> Option<Ipv4Addr> {
    message.answers().iter().find_map(|record| match record.data() {
        Some(RData::A(a)) => Some(a.0),
        _ => None,
    })
}
