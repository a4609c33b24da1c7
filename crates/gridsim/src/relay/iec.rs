//! IEC 61850 connection task
//!
//! Answers the association handshake and name-list queries without a real
//! MMS stack, so clients can connect and browse the simulated IED.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::RelayResult;
use super::endpoint::Connection;
use super::mms::{self, Domains, Exchange};
use crate::server::TraceDirection;

pub(super) async fn serve(mut stream: TcpStream, mut conn: Connection) -> RelayResult<()> {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            read = stream.read_buf(&mut buf) => {
                if read? == 0 {
                    return Ok(());
                }
                loop {
                    match mms::next_tpkt(&mut buf) {
                        Ok(Some(packet)) => {
                            let exchange = answer(&conn, &packet);
                            if let Some(reply) = exchange.reply {
                                conn.relay.trace_iec(TraceDirection::Out, &conn.endpoint, exchange.kind, &reply);
                                stream.write_all(&reply).await?;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(endpoint = %conn.endpoint, peer = %conn.peer, error = %e, "Dropping client");
                            return Ok(());
                        }
                    }
                }
            }
            _ = conn.shutdown.changed() => return Ok(()),
        }
    }
}

fn answer(conn: &Connection, packet: &[u8]) -> Exchange {
    let (first, count) = conn.relay.logical_devices();
    let exchange = mms::respond(
        packet,
        Domains {
            first: first.as_deref(),
            count,
        },
    );
    conn.relay
        .trace_iec(TraceDirection::In, &conn.endpoint, exchange.kind, packet);
    match exchange.reply {
        Some(_) => trace!(endpoint = %conn.endpoint, kind = exchange.kind, "MMS exchange"),
        None => debug!(endpoint = %conn.endpoint, kind = exchange.kind, len = packet.len(), "Unanswered packet"),
    }
    exchange
}
