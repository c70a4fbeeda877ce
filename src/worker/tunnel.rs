//! Raw byte relay for CONNECT tunnels.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use crate::net::send_all;

const BUF_SIZE: usize = 4096;

/// Copy bytes both ways until either side closes or errors, both stay idle
/// for `idle`, or one write takes longer than `write_limit`. Returns bytes
/// forwarded (client to origin, origin to client).
pub async fn relay(
    client: &mut TcpStream,
    origin: &mut TcpStream,
    idle: Duration,
    write_limit: Duration,
) -> (u64, u64) {
    let (mut client_read, mut client_write) = client.split();
    let (mut origin_read, mut origin_write) = origin.split();
    let mut upstream = vec![0u8; BUF_SIZE];
    let mut downstream = vec![0u8; BUF_SIZE];
    let (mut up, mut down) = (0u64, 0u64);

    loop {
        tokio::select! {
            read = timeout(idle, client_read.read(&mut upstream)) => match read {
                Ok(Ok(n)) if n > 0 => {
                    let sent = send_all(&mut origin_write, &upstream[..n], write_limit).await;
                    if let Err(e) = sent {
                        trace!(error = %e, "origin write failed");
                        break;
                    }
                    up += n as u64;
                }
                Ok(Ok(_)) => {
                    trace!("client closed tunnel");
                    break;
                }
                Ok(Err(e)) => {
                    trace!(error = %e, "client read failed");
                    break;
                }
                Err(_) => {
                    trace!("tunnel idle");
                    break;
                }
            },
            read = timeout(idle, origin_read.read(&mut downstream)) => match read {
                Ok(Ok(n)) if n > 0 => {
                    let sent = send_all(&mut client_write, &downstream[..n], write_limit).await;
                    if let Err(e) = sent {
                        trace!(error = %e, "client write failed");
                        break;
                    }
                    down += n as u64;
                }
                Ok(Ok(_)) => {
                    trace!("origin closed tunnel");
                    break;
                }
                Ok(Err(e)) => {
                    trace!(error = %e, "origin read failed");
                    break;
                }
                Err(_) => {
                    trace!("tunnel idle");
                    break;
                }
            },
        }
    }

    (up, down)
}
