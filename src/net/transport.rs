//! UDP transport: one socket per poll cycle plus a reader thread
//!
//! The transport owns a single UDPv4 socket bound to the primary interface on
//! the miIO port. A named reader thread copies every inbound datagram into a
//! bounded channel together with its source address and arrival timestamp;
//! the poller demultiplexes from that channel. Outbound sends go straight to
//! the socket.
//!
//! The reader polls with a short receive timeout so that `stop()` only has to
//! raise the shutdown flag and join; no cross-thread socket close is needed.

use crate::error::Result;
use crate::miio::timestamp::TimeStamp;
use crate::net::addr;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Largest datagram a miIO device sends; replies fit comfortably
const RECV_BUFFER_SIZE: usize = 1024;

/// Reader wake-up interval for shutdown checks
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One inbound datagram with its arrival metadata
#[derive(Debug, Clone)]
pub struct UdpPacket {
    pub address: SocketAddrV4,
    pub data: Vec<u8>,
    pub stamp: TimeStamp,
}

pub struct UdpTransport {
    local_address: SocketAddrV4,
    broadcast_address: SocketAddrV4,
    socket: UdpSocket,
    packets: Receiver<UdpPacket>,
    shutdown: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Resolve local addresses, bind the socket and launch the reader
    ///
    /// The inbound channel is bounded at `1 + 2 × device_count`, enough for a
    /// hello reply plus an info and a get_prop reply per device in flight.
    pub fn start(port: u16, device_count: usize) -> Result<UdpTransport> {
        let (local_address, broadcast_address) = addr::udp_addresses(port)?;
        let socket = UdpSocket::bind(local_address)?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;

        let (tx, rx) = bounded(1 + 2 * device_count);
        let shutdown = Arc::new(AtomicBool::new(false));
        let reader_socket = socket.try_clone()?;
        let reader_shutdown = Arc::clone(&shutdown);
        let reader = thread::Builder::new()
            .name("udp-reader".to_string())
            .spawn(move || read_loop(reader_socket, tx, reader_shutdown))?;

        info!(
            "listening on {} for UDP packets (broadcast {})",
            local_address, broadcast_address
        );
        Ok(UdpTransport {
            local_address,
            broadcast_address,
            socket,
            packets: rx,
            shutdown,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn local_address(&self) -> SocketAddrV4 {
        self.local_address
    }

    pub fn broadcast_address(&self) -> SocketAddrV4 {
        self.broadcast_address
    }

    /// Inbound packets in arrival order
    pub fn packets(&self) -> &Receiver<UdpPacket> {
        &self.packets
    }

    /// Non-blocking unicast/broadcast send
    pub fn send_to(&self, data: &[u8], address: SocketAddrV4) -> Result<()> {
        self.socket.send_to(data, address)?;
        Ok(())
    }

    /// Stop the reader and drain undelivered packets
    ///
    /// Idempotent; the transport is unusable for receiving afterwards.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(reader) = self.reader.lock().take() {
            if reader.join().is_err() {
                error!("UDP reader thread panicked");
            }
        }
        let mut purged = 0;
        while self.packets.try_recv().is_ok() {
            purged += 1;
        }
        if purged > 0 {
            debug!("{} packets purged", purged);
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(socket: UdpSocket, tx: Sender<UdpPacket>, shutdown: Arc<AtomicBool>) {
    let mut buffer = [0u8; RECV_BUFFER_SIZE];
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buffer) {
            Ok((len, SocketAddr::V4(address))) => {
                let packet = UdpPacket {
                    address,
                    data: buffer[..len].to_vec(),
                    stamp: TimeStamp::now(),
                };
                debug!("{} bytes received from {}", len, address);
                match tx.try_send(packet) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("inbound packet queue full, dropping packet from {}", address);
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Ok((len, address)) => {
                debug!("ignoring {} non-IPv4 bytes from {}", len, address);
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                // Receive timeout; loop around to check the shutdown flag.
            }
            Err(err) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                warn!("{}", err);
            }
        }
    }
    debug!("stop listening for UDP packets");
}
