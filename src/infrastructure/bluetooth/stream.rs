//! Stream radio
//!
//! Serial-style peripherals that expose a byte stream instead of a GATT
//! table. Each peer presents a single service with a single characteristic:
//! writing sends bytes down the stream, subscribing makes the link's read
//! loop report every chunk as a value change. Reads are not supported.
//!
//! The read loop runs from connect onwards so that a peer closing the stream
//! is noticed on idle and write-only links too. Chunks that arrive before a
//! subscribe are dropped.
//!
//! The transport is pluggable through [`StreamConnector`]; [`TcpConnector`]
//! reaches peers at `host:port` endpoints.

use crate::domain::error::RadioError;
use crate::domain::models::{
    Address, Advertisement, CharacteristicInfo, ConnectionHandle, RadioHandle, ServiceMap,
};
use crate::infrastructure::bluetooth::radio::{LinkEvent, PairedDevice, Radio, ScanEvent, ScanFilter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self, handle: &RadioHandle) -> io::Result<Self::Stream>;
}

/// Connects to the `host:port` carried in the radio handle
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl StreamConnector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, handle: &RadioHandle) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(handle.as_str()).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// A peer the stream radio reports while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPeer {
    pub address: Address,
    pub name: Option<String>,
    pub handle: RadioHandle,
}

struct StreamLink<S> {
    address: Address,
    writer: Arc<tokio::sync::Mutex<WriteHalf<S>>>,
    /// Set by subscribe; the read loop forwards chunks only while set
    subscribed: Arc<AtomicBool>,
    read_task: JoinHandle<()>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

type LinkTable<S> = Mutex<HashMap<u64, StreamLink<S>>>;

fn lock_links<S>(links: &LinkTable<S>) -> MutexGuard<'_, HashMap<u64, StreamLink<S>>> {
    links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct StreamRadio<C: StreamConnector> {
    connector: C,
    peers: Vec<StreamPeer>,
    service_uuid: Uuid,
    notify_descriptor: Uuid,
    buffer_size: usize,
    scan_sink: Mutex<Option<mpsc::UnboundedSender<ScanEvent>>>,
    links: Arc<LinkTable<C::Stream>>,
    next_link: AtomicU64,
}

impl<C: StreamConnector> StreamRadio<C> {
    /// `service_uuid` names both the single service and its data characteristic.
    /// The characteristic is reported with `notify_descriptor` so it can be
    /// subscribed to like a GATT characteristic.
    pub fn new(
        connector: C,
        peers: Vec<StreamPeer>,
        service_uuid: Uuid,
        notify_descriptor: Uuid,
        buffer_size: usize,
    ) -> Self {
        Self {
            connector,
            peers,
            service_uuid,
            notify_descriptor,
            buffer_size: buffer_size.max(1),
            scan_sink: Mutex::new(None),
            links: Arc::new(Mutex::new(HashMap::new())),
            next_link: AtomicU64::new(1),
        }
    }

    fn links(&self) -> MutexGuard<'_, HashMap<u64, StreamLink<C::Stream>>> {
        lock_links(&self.links)
    }

    /// Number of links currently held open
    pub fn open_links(&self) -> usize {
        self.links().len()
    }

    fn check_target(&self, service: Uuid, characteristic: Uuid) -> Result<(), RadioError> {
        if service == self.service_uuid && characteristic == self.service_uuid {
            Ok(())
        } else {
            Err(RadioError::NotFound(format!("{}/{}", service, characteristic)))
        }
    }

    fn writer(&self, link: &ConnectionHandle) -> Result<Arc<tokio::sync::Mutex<WriteHalf<C::Stream>>>, RadioError> {
        self.links()
            .get(&link.id)
            .map(|stream| stream.writer.clone())
            .ok_or(RadioError::Disconnected)
    }

    /// Report the link gone and forget it
    fn lose(&self, link: &ConnectionHandle) {
        let removed = self.links().remove(&link.id);
        if let Some(stream) = removed {
            stream.read_task.abort();
            let _ = stream.events.send(LinkEvent::Disconnected);
        }
    }
}

struct ReadLoop<S> {
    id: u64,
    address: Address,
    service: Uuid,
    buffer_size: usize,
    subscribed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LinkEvent>,
    links: Weak<LinkTable<S>>,
}

impl<S> ReadLoop<S> {
    async fn run(self, mut reader: ReadHalf<S>)
    where
        S: AsyncRead,
    {
        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => {
                    info!("Stream from {} ended", self.address);
                    break;
                }
                Ok(n) if self.subscribed.load(Ordering::Acquire) => {
                    let event = LinkEvent::ValueChanged {
                        service: self.service,
                        characteristic: self.service,
                        value: buffer[..n].to_vec(),
                    };
                    if self.events.send(event).is_err() {
                        return;
                    }
                }
                Ok(n) => debug!("Dropping {} unsolicited bytes from {}", n, self.address),
                Err(e) => {
                    warn!("Read from {} failed: {}", self.address, e);
                    break;
                }
            }
        }

        // Forget the link before reporting it, so nothing can write to a dead stream
        if let Some(links) = self.links.upgrade() {
            lock_links(&links).remove(&self.id);
        }
        let _ = self.events.send(LinkEvent::Disconnected);
    }
}

#[async_trait]
impl<C: StreamConnector> Radio for StreamRadio<C> {
    fn start_scan(
        &self,
        filter: &ScanFilter,
        sink: mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<(), RadioError> {
        let wanted = filter.service_uuids.is_empty() || filter.service_uuids.contains(&self.service_uuid);
        if wanted {
            for peer in &self.peers {
                let advertisement = Advertisement {
                    address: peer.address.clone(),
                    name: peer.name.clone(),
                    signal: 0,
                    handle: peer.handle.clone(),
                };
                let _ = sink.send(ScanEvent::Advertisement(advertisement));
            }
        }
        *self
            .scan_sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), RadioError> {
        self.scan_sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        Ok(())
    }

    async fn connect(
        &self,
        handle: &RadioHandle,
        address: &Address,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<ConnectionHandle, RadioError> {
        info!("Opening stream to {} at {}", address, handle.as_str());
        let stream = self
            .connector
            .connect(handle)
            .await
            .map_err(|e| RadioError::ConnectFailed(format!("{}: {}", handle.as_str(), e)))?;
        let (reader, writer) = tokio::io::split(stream);

        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let subscribed = Arc::new(AtomicBool::new(false));
        // Hold the table while spawning so the loop cannot remove the link
        // before it is inserted
        let mut links = self.links();
        let read_loop = ReadLoop {
            id,
            address: address.clone(),
            service: self.service_uuid,
            buffer_size: self.buffer_size,
            subscribed: subscribed.clone(),
            events: events.clone(),
            links: Arc::downgrade(&self.links),
        };
        links.insert(
            id,
            StreamLink {
                address: address.clone(),
                writer: Arc::new(tokio::sync::Mutex::new(writer)),
                subscribed,
                read_task: tokio::spawn(read_loop.run(reader)),
                events,
            },
        );
        drop(links);
        Ok(ConnectionHandle {
            id,
            address: address.clone(),
        })
    }

    async fn discover(&self, link: &ConnectionHandle) -> Result<ServiceMap, RadioError> {
        if !self.links().contains_key(&link.id) {
            return Err(RadioError::Disconnected);
        }
        Ok(ServiceMap::new().with_service(
            self.service_uuid,
            vec![CharacteristicInfo::new(self.service_uuid).with_descriptor(self.notify_descriptor)],
        ))
    }

    async fn read(
        &self,
        _link: &ConnectionHandle,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError> {
        Err(RadioError::Unsupported("read on a stream link"))
    }

    async fn write(
        &self,
        link: &ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<Vec<u8>, RadioError> {
        self.check_target(service, characteristic)?;
        let writer = self.writer(link)?;

        let mut writer = writer.lock().await;
        let sent = match writer.write_all(payload).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        drop(writer);

        match sent {
            // A stream write has no separate confirmation; what was sent is what was written
            Ok(()) => Ok(payload.to_vec()),
            Err(e) => {
                warn!("Write to {} failed: {}", link.address, e);
                self.lose(link);
                Err(RadioError::Io(e))
            }
        }
    }

    async fn subscribe(
        &self,
        link: &ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
        _descriptor: Uuid,
    ) -> Result<Vec<u8>, RadioError> {
        self.check_target(service, characteristic)?;

        let links = self.links();
        let stream = links.get(&link.id).ok_or(RadioError::Disconnected)?;
        if !stream.subscribed.swap(true, Ordering::AcqRel) {
            debug!("Forwarding stream data from {}", stream.address);
        }
        Ok(Vec::new())
    }

    async fn disconnect(&self, link: &ConnectionHandle) {
        let removed = self.links().remove(&link.id);
        let Some(stream) = removed else {
            return;
        };
        stream.read_task.abort();
        let mut writer = stream.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Shutting down stream to {}: {}", link.address, e);
        }
    }

    fn paired_devices(&self) -> Vec<PairedDevice> {
        self.peers
            .iter()
            .map(|peer| PairedDevice {
                address: peer.address.clone(),
                name: peer.name.clone(),
                handle: peer.handle.clone(),
            })
            .collect()
    }
}
