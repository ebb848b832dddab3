//! Peer node: listening socket with port-offset retry, the reactor, message dispatch, the inbound
//! message queue and the local/download catalogs.
//!
//! One reactor task owns the listener and consumes events from per-connection reader tasks, so
//! inbound traffic is handled serially in arrival order. Everything shared with workers and the
//! application sits in [`NodeState`] behind one mutex.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use p2pft_core::chunk::{self, MissingRange};
use p2pft_core::protocol::{self, command, DIRECTORY_CONNECTION};
use p2pft_core::wire;
use p2pft_core::{
    scheduler, Catalog, ControlMessage, FileAddress, FileItem, FileLookup, Inbound, PeerEndpoint,
    PieceTracker, StreamDecoder,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{ConnectionId, ConnectionInfo, ConnectionRole, ConnectionTable, LISTENER_ID};
use crate::error::NodeError;
use crate::transfer::{self, SendJob};

const LISTEN_HOST: &str = "0.0.0.0";
const WAITING_FOR_SEEDERS: &str = "Waiting for seeders...";

/// An inbound control message nobody inside the node consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub connection: ConnectionId,
    pub text: String,
}

enum ReaderEvent {
    Data(ConnectionId, Inbound),
    Closed(ConnectionId),
}

struct Link {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    reader: Option<JoinHandle<()>>,
}

struct NodeState {
    connections: ConnectionTable<Link>,
    pending_close: Vec<ConnectionId>,
    queue: VecDeque<QueuedMessage>,
    local_files: Catalog,
    downloads: Catalog,
}

struct Shared {
    config: Config,
    tracker: PieceTracker,
    local_addr: SocketAddr,
    state: Mutex<NodeState>,
    events: mpsc::UnboundedSender<ReaderEvent>,
    /// Listener and event receiver until the reactor takes them.
    idle: Mutex<Option<(TcpListener, mpsc::UnboundedReceiver<ReaderEvent>)>>,
    reactor: Mutex<Option<JoinHandle<()>>>,
    message_ready: Notify,
    close_requested: Notify,
    shutdown: Notify,
}

/// Handle to a running (or bound, not yet started) node. Cheap to clone.
#[derive(Clone)]
pub struct PeerNode {
    shared: Arc<Shared>,
}

impl PeerNode {
    /// Validate `config` and bind the listener on the first free port in
    /// `base_port .. base_port + max_port_offset`.
    pub async fn bind(config: Config) -> Result<Self, NodeError> {
        config.validate()?;
        let listener = bind_listener(config.base_port, config.max_port_offset).await?;
        let local_addr = listener.local_addr()?;
        info!(port = local_addr.port(), "listening");
        let (events, events_rx) = mpsc::unbounded_channel();
        let state = NodeState {
            connections: ConnectionTable::new(config.max_connections),
            pending_close: Vec::new(),
            queue: VecDeque::new(),
            local_files: Catalog::new(),
            downloads: Catalog::new(),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                tracker: PieceTracker::new(config.transfer.clone()),
                config,
                local_addr,
                state: Mutex::new(state),
                events,
                idle: Mutex::new(Some((listener, events_rx))),
                reactor: Mutex::new(None),
                message_ready: Notify::new(),
                close_requested: Notify::new(),
                shutdown: Notify::new(),
            }),
        })
    }

    /// Spawn the reactor.
    pub async fn start(&self) -> Result<(), NodeError> {
        let (listener, events) = self
            .shared
            .idle
            .lock()
            .await
            .take()
            .ok_or(NodeError::AlreadyStarted)?;
        let handle = tokio::spawn(run_reactor(self.clone(), listener, events));
        *self.shared.reactor.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the reactor and close every connection.
    pub async fn shutdown(&self) {
        self.shared.shutdown.notify_one();
        let handle = self.shared.reactor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "reactor ended abnormally");
            }
        }
        self.close_all().await;
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn tracker(&self) -> &PieceTracker {
        &self.shared.tracker
    }

    /// Port actually bound; advertised to other peers.
    pub fn public_port(&self) -> u16 {
        self.shared.local_addr.port()
    }

    /// Open an outbound connection carrying a logical `name`.
    pub async fn connect(&self, host: &str, port: u16, name: &str) -> Result<ConnectionId, NodeError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| NodeError::ConnectFailure {
                addr: format!("{}:{}", host, port),
                source,
            })?;
        let mut state = self.shared.state.lock().await;
        let id = self.register(&mut state, stream, ConnectionRole::OutboundNamed, Some(name.to_string()))?;
        debug!(connection = id, name, host, port, "connected");
        Ok(id)
    }

    /// Connect to the configured directory server as `central_server`.
    pub async fn connect_directory(&self) -> Result<ConnectionId, NodeError> {
        let host = self.shared.config.directory_host.clone();
        let id = self
            .connect(&host, self.shared.config.directory_port, DIRECTORY_CONNECTION)
            .await?;
        info!(connection = id, host = %host, port = self.shared.config.directory_port, "directory connected");
        Ok(id)
    }

    /// Close a connection now.
    pub async fn close(&self, id: ConnectionId) -> Result<(), NodeError> {
        let mut state = self.shared.state.lock().await;
        if close_entry(&mut state, id) {
            Ok(())
        } else {
            Err(NodeError::UnknownConnection(id))
        }
    }

    /// Close every connection named `name` now. Returns how many were closed.
    pub async fn close_by_name(&self, name: &str) -> usize {
        let mut state = self.shared.state.lock().await;
        let ids = state.connections.ids_named(name);
        ids.into_iter().filter(|id| close_entry(&mut state, *id)).count()
    }

    /// Ask the reactor to close `id` at the top of its next iteration.
    pub async fn queue_close(&self, id: ConnectionId) {
        self.shared.state.lock().await.pending_close.push(id);
        self.shared.close_requested.notify_one();
    }

    /// Queue every connection named `name` for closure. Returns how many were queued.
    pub async fn queue_close_by_name(&self, name: &str) -> usize {
        let queued = {
            let mut state = self.shared.state.lock().await;
            let ids = state.connections.ids_named(name);
            let n = ids.len();
            state.pending_close.extend(ids);
            n
        };
        if queued > 0 {
            self.shared.close_requested.notify_one();
        }
        queued
    }

    /// Live connections, the listener first.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.shared.state.lock().await;
        let mut out = vec![ConnectionInfo {
            id: LISTENER_ID,
            role: ConnectionRole::Listening,
            name: None,
            peer_addr: None,
            local_addr: Some(self.shared.local_addr),
        }];
        out.extend(state.connections.infos().cloned());
        out
    }

    /// Sockets held, the listener included.
    pub async fn connection_count(&self) -> usize {
        self.shared.state.lock().await.connections.len() + 1
    }

    pub async fn connections_last_modified(&self) -> SystemTime {
        self.shared.state.lock().await.connections.last_modified()
    }

    pub async fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        let state = self.shared.state.lock().await;
        state.connections.get(id).and_then(|(info, _)| info.peer_addr)
    }

    pub async fn has_connection_named(&self, name: &str) -> bool {
        self.connection_named(name).await.is_some()
    }

    /// Most recent connection carrying `name`.
    pub async fn connection_named(&self, name: &str) -> Option<ConnectionId> {
        self.shared.state.lock().await.connections.find_named(name)
    }

    pub async fn send_to(&self, id: ConnectionId, bytes: &[u8]) -> Result<(), NodeError> {
        let writer = {
            let state = self.shared.state.lock().await;
            let (_, link) = state
                .connections
                .get(id)
                .ok_or(NodeError::UnknownConnection(id))?;
            link.writer.clone()
        };
        let mut writer = writer.lock().await;
        transfer::write_all_counted(&mut *writer, bytes).await
    }

    pub async fn send_to_named(&self, name: &str, bytes: &[u8]) -> Result<(), NodeError> {
        let id = self
            .connection_named(name)
            .await
            .ok_or_else(|| NodeError::UnknownName(name.to_string()))?;
        self.send_to(id, bytes).await
    }

    /// Ask the peer on `id` for chunks `range` of `item`.
    pub async fn request_file_transfer(
        &self,
        id: ConnectionId,
        item: &FileItem,
        range: MissingRange,
    ) -> Result<(), NodeError> {
        let request = ControlMessage::FileRequest {
            file_id: item.file_id,
            name: item.name.clone(),
            size: item.size,
            start: range.start,
            count: range.count,
        };
        self.send_to(id, request.encode().as_bytes()).await
    }

    /// `getFile` lookup at the directory.
    pub async fn request_file(&self, file_id: u32) -> Result<(), NodeError> {
        let msg = ControlMessage::GetFile { file_id };
        self.send_to_named(DIRECTORY_CONNECTION, msg.encode().as_bytes())
            .await
    }

    /// Ask the directory for its listing. The answer arrives on the message queue.
    pub async fn list_files(&self) -> Result<(), NodeError> {
        self.send_to_named(DIRECTORY_CONNECTION, ControlMessage::List.encode().as_bytes())
            .await
    }

    /// Announce `items` to the directory with this node's reachable address.
    pub async fn announce_files(&self, items: &[FileItem]) -> Result<(), NodeError> {
        let endpoint = self.advertised_endpoint().await?;
        let msg = ControlMessage::AddFiles {
            endpoint,
            files: items.iter().map(FileItem::shared_file).collect(),
        };
        self.send_to_named(DIRECTORY_CONNECTION, msg.encode().as_bytes())
            .await
    }

    async fn advertised_endpoint(&self) -> Result<PeerEndpoint, NodeError> {
        let port = self.public_port();
        if let Some(host) = &self.shared.config.advertise_host {
            return Ok(PeerEndpoint::new(host.clone(), port));
        }
        let state = self.shared.state.lock().await;
        let id = state
            .connections
            .find_named(DIRECTORY_CONNECTION)
            .ok_or_else(|| NodeError::UnknownName(DIRECTORY_CONNECTION.to_string()))?;
        let host = state
            .connections
            .get(id)
            .and_then(|(info, _)| info.local_addr)
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        Ok(PeerEndpoint::new(host, port))
    }

    pub async fn pop_message(&self) -> Option<QueuedMessage> {
        self.shared.state.lock().await.queue.pop_front()
    }

    pub async fn queued_messages(&self) -> usize {
        self.shared.state.lock().await.queue.len()
    }

    /// Wait for the next queued message.
    pub async fn next_message(&self) -> QueuedMessage {
        loop {
            let ready = self.shared.message_ready.notified();
            if let Some(msg) = self.pop_message().await {
                return msg;
            }
            ready.await;
        }
    }

    async fn enqueue(&self, connection: ConnectionId, text: String) {
        self.shared
            .state
            .lock()
            .await
            .queue
            .push_back(QueuedMessage { connection, text });
        self.shared.message_ready.notify_one();
    }

    /// Add files this node shares. Returns how many were new.
    pub async fn add_local_files(&self, items: Vec<FileItem>) -> usize {
        self.shared.state.lock().await.local_files.add_items(items)
    }

    pub async fn has_local_file(&self, name: &str, size: u64) -> bool {
        self.shared.state.lock().await.local_files.contains(name, size)
    }

    pub async fn local_file(&self, name: &str, size: u64) -> Option<FileItem> {
        self.shared.state.lock().await.local_files.get(name, size).cloned()
    }

    pub async fn local_files(&self) -> Vec<FileItem> {
        self.shared.state.lock().await.local_files.items().to_vec()
    }

    pub async fn add_download_files(&self, items: Vec<FileItem>) -> usize {
        self.shared.state.lock().await.downloads.add_items(items)
    }

    pub async fn has_download_file(&self, name: &str, size: u64) -> bool {
        self.shared.state.lock().await.downloads.contains(name, size)
    }

    pub async fn download_file(&self, name: &str, size: u64) -> Option<FileItem> {
        self.shared.state.lock().await.downloads.get(name, size).cloned()
    }

    pub async fn download_file_by_id(&self, file_id: u32) -> Option<FileItem> {
        self.shared.state.lock().await.downloads.by_id(file_id).cloned()
    }

    pub async fn downloads(&self) -> Vec<FileItem> {
        self.shared.state.lock().await.downloads.items().to_vec()
    }

    /// Move a reassembled download into the local catalog.
    pub(crate) async fn finish_download(&self, item: FileItem) {
        let mut state = self.shared.state.lock().await;
        state.downloads.remove_by_id(item.file_id);
        state.local_files.add_items([item]);
    }

    pub(crate) async fn record_missing(&self, file_id: u32, ranges: &[MissingRange]) {
        let mut state = self.shared.state.lock().await;
        if let Some(item) = state.downloads.by_id_mut(file_id) {
            item.set_missing_ranges(ranges);
        }
    }

    /// One line per active download, or a notice when there is none. A download whose fragment
    /// directory does not exist yet reports that it is waiting for seeders.
    pub async fn file_progress(&self) -> Result<String, NodeError> {
        let downloads = self.downloads().await;
        if downloads.is_empty() {
            return Ok("You have no active file transfers.".to_string());
        }
        let tracker = self.shared.tracker.clone();
        let lines = tokio::task::spawn_blocking(move || {
            downloads
                .iter()
                .map(|item| {
                    let progress = match tracker.stored_bytes(item.file_id) {
                        Some(bytes) => format!("{} of {} bytes", bytes, item.size),
                        None => WAITING_FOR_SEEDERS.to_string(),
                    };
                    format!("\t{}\t{}", item.name, progress)
                })
                .collect::<Vec<_>>()
        })
        .await?;
        Ok(lines.join("\n"))
    }

    /// Act on a `fileAddress` answer: record the download and request its missing chunks from
    /// the advertised peers, one connection per (peer, range). Returns the requests issued.
    pub async fn handle_file_address(&self, lookup: FileLookup) -> Result<usize, NodeError> {
        let FileLookup::Found {
            file_id,
            name,
            size,
            peers,
        } = lookup
        else {
            info!("file unknown to the directory, no seeders");
            return Ok(0);
        };
        if peers.is_empty() {
            info!(file_id, file = %name, "no seeders");
            return Ok(0);
        }
        let chunk_size = self.shared.tracker.chunk_size();
        let Some(total) = chunk::checked_total_chunks(size, chunk_size) else {
            warn!(file_id, file = %name, size, "file too large to index in chunks, ignored");
            return Ok(0);
        };

        let (item, ranges) = {
            let mut state = self.shared.state.lock().await;
            if state.local_files.contains(&name, size) {
                info!(file_id, file = %name, "already shared locally, not downloading");
                return Ok(0);
            }
            if state.downloads.by_id(file_id).is_none() {
                state.downloads.add_items([FileItem::new(file_id, name.clone(), size)]);
            }
            let Some(item) = state.downloads.by_id_mut(file_id) else {
                return Ok(0);
            };
            for peer in &peers {
                item.add_address(FileAddress::from_endpoint(peer.clone()));
            }
            let mut ranges = item.missing_ranges();
            if ranges.is_empty() {
                ranges.push(MissingRange::whole(total));
            }
            (item.clone(), ranges)
        };

        let name = item.file_id.to_string();
        let mut issued = 0;
        for (peer, range) in scheduler::plan_requests(&ranges, peers.len()) {
            let endpoint = &peers[peer];
            let id = match self.connect(&endpoint.host, endpoint.port, &name).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(peer = %endpoint, error = %e, "seeder unreachable");
                    continue;
                }
            };
            match self.request_file_transfer(id, &item, range).await {
                Ok(()) => {
                    debug!(connection = id, peer = %endpoint, start = range.start, count = range.count, "chunks requested");
                    issued += 1;
                }
                Err(e) => warn!(peer = %endpoint, error = %e, "request not sent"),
            }
        }
        info!(file_id = item.file_id, file = %item.name, requests = issued, "download requested");
        Ok(issued)
    }

    fn register(
        &self,
        state: &mut NodeState,
        stream: TcpStream,
        role: ConnectionRole,
        name: Option<String>,
    ) -> Result<ConnectionId, NodeError> {
        let capacity = state.connections.capacity();
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        let (reader, writer) = stream.into_split();
        let link = Link {
            writer: Arc::new(Mutex::new(writer)),
            reader: None,
        };
        let id = state
            .connections
            .insert(role, name, peer, local, link)
            .map_err(|_| NodeError::TableFull { capacity })?;
        let task = tokio::spawn(read_loop(
            id,
            reader,
            self.shared.config.read_buffer_size,
            self.shared.events.clone(),
        ));
        if let Some(link) = state.connections.link_mut(id) {
            link.reader = Some(task);
        }
        Ok(id)
    }

    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let mut state = self.shared.state.lock().await;
        if state.connections.is_full() {
            drop(state);
            warn!(%peer, "connection table full, refusing");
            refuse(stream).await;
            return;
        }
        match self.register(&mut state, stream, ConnectionRole::InboundUnnamed, None) {
            Ok(id) => info!(connection = id, %peer, "connection accepted"),
            Err(e) => warn!(%peer, error = %e, "connection not registered"),
        }
    }

    async fn flush_pending_closes(&self) {
        let mut state = self.shared.state.lock().await;
        let pending = std::mem::take(&mut state.pending_close);
        for id in pending {
            close_entry(&mut state, id);
        }
    }

    async fn close_all(&self) {
        let mut state = self.shared.state.lock().await;
        let ids = state.connections.ids();
        for id in ids {
            close_entry(&mut state, id);
        }
        state.pending_close.clear();
    }

    async fn handle_event(&self, event: ReaderEvent) {
        match event {
            ReaderEvent::Closed(id) => {
                let mut state = self.shared.state.lock().await;
                close_entry(&mut state, id);
            }
            ReaderEvent::Data(id, Inbound::Malformed(reason)) => {
                warn!(connection = id, reason, "malformed chunk header, dropped");
            }
            ReaderEvent::Data(id, Inbound::Frame(bytes)) => self.on_frame(id, bytes).await,
            ReaderEvent::Data(id, Inbound::Control(text)) => self.on_control(id, text).await,
        }
    }

    async fn on_frame(&self, id: ConnectionId, bytes: Vec<u8>) {
        let file_id = match wire::decode_header(&bytes) {
            Ok(header) => header.file_id,
            Err(e) => {
                warn!(connection = id, error = %e, "undecodable chunk frame, dropped");
                return;
            }
        };
        let active = self.shared.state.lock().await.downloads.by_id(file_id).is_some();
        if !active {
            warn!(connection = id, file_id, "chunk for no active download, dropped");
            return;
        }
        let tracker = self.shared.tracker.clone();
        tokio::task::spawn_blocking(move || transfer::receive_chunk(&tracker, &bytes));
    }

    async fn on_control(&self, id: ConnectionId, text: String) {
        match protocol::command_of(&text) {
            command::FILE_REQUEST => match ControlMessage::parse(&text) {
                Ok(ControlMessage::FileRequest {
                    file_id,
                    name,
                    size,
                    start,
                    count,
                }) => self.on_file_request(id, file_id, &name, size, start, count).await,
                Ok(_) => {}
                Err(e) => warn!(connection = id, error = %e, "bad fileRequest, dropped"),
            },
            command::FILE_ADDRESS => {
                if !self.is_directory(id).await {
                    warn!(connection = id, "fileAddress from a connection other than the directory");
                    self.enqueue(id, text).await;
                    return;
                }
                match ControlMessage::parse(&text) {
                    Ok(ControlMessage::FileAddress(lookup)) => {
                        let node = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = node.handle_file_address(lookup).await {
                                warn!(error = %e, "fileAddress not handled");
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(e) => warn!(connection = id, error = %e, "bad fileAddress, dropped"),
                }
            }
            _ => self.enqueue(id, text).await,
        }
    }

    async fn is_directory(&self, id: ConnectionId) -> bool {
        let state = self.shared.state.lock().await;
        state
            .connections
            .get(id)
            .is_some_and(|(info, _)| info.name.as_deref() == Some(DIRECTORY_CONNECTION))
    }

    async fn on_file_request(
        &self,
        id: ConnectionId,
        file_id: u32,
        name: &str,
        size: u64,
        start: u32,
        count: u32,
    ) {
        let (path, writer) = {
            let state = self.shared.state.lock().await;
            let Some(item) = state.local_files.get(name, size) else {
                warn!(connection = id, file = name, size, "request for a file not shared here");
                return;
            };
            let Some((_, link)) = state.connections.get(id) else {
                return;
            };
            (item.path.clone(), link.writer.clone())
        };
        let job = SendJob {
            file_id,
            path,
            start,
            count,
        };
        let chunk_size = self.shared.tracker.chunk_size();
        let pacing = self.shared.config.send_pacing();
        tokio::spawn(async move {
            match transfer::send_chunk_range(&*writer, &job, chunk_size, pacing).await {
                Ok(sent) => debug!(connection = id, file_id = job.file_id, sent, "request served"),
                Err(e) => warn!(connection = id, file_id = job.file_id, error = %e, "request not served"),
            }
        });
    }
}

async fn bind_listener(base_port: u16, max_offset: u16) -> Result<TcpListener, NodeError> {
    let end = u32::from(base_port) + u32::from(max_offset);
    for port in u32::from(base_port)..end {
        let Ok(port) = u16::try_from(port) else {
            break;
        };
        match TcpListener::bind((LISTEN_HOST, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!(port, error = %e, "port unavailable"),
        }
    }
    Err(NodeError::BindExhausted {
        base: base_port,
        end,
    })
}

async fn run_reactor(
    node: PeerNode,
    listener: TcpListener,
    mut events: mpsc::UnboundedReceiver<ReaderEvent>,
) {
    loop {
        node.flush_pending_closes().await;
        tokio::select! {
            _ = node.shared.shutdown.notified() => break,
            _ = node.shared.close_requested.notified() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => node.admit(stream, peer).await,
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(event) = events.recv() => node.handle_event(event).await,
        }
    }
    node.close_all().await;
    info!("reactor stopped");
}

async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    buffer_size: usize,
    events: mpsc::UnboundedSender<ReaderEvent>,
) {
    let mut decoder = StreamDecoder::new();
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for item in decoder.push(&buf[..n]) {
                    if events.send(ReaderEvent::Data(id, item)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                debug!(connection = id, error = %e, "read failed");
                break;
            }
        }
    }
    let _ = events.send(ReaderEvent::Closed(id));
}

/// Tell a refused peer why, then drop it.
async fn refuse(mut stream: TcpStream) {
    if let Err(e) = stream.write_all(protocol::BUSY_NOTICE.as_bytes()).await {
        debug!(error = %e, "busy notice not delivered");
    }
    let _ = stream.shutdown().await;
}

/// Remove `id`, stop its reader and drop its writer. False if it was not registered.
fn close_entry(state: &mut NodeState, id: ConnectionId) -> bool {
    let Some((info, link)) = state.connections.remove(id) else {
        return false;
    };
    if let Some(reader) = link.reader {
        reader.abort();
    }
    info!(connection = id, role = %info.role, name = info.name.as_deref().unwrap_or(""), "connection closed");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::TransferMonitor;
    use p2pft_core::catalog::collect_files;
    use p2pft_core::{decode_chunk_frame, encode_chunk_frame, FragmentName, TransferConfig};
    use std::future::Future;
    use std::path::Path;
    use std::time::Duration;

    fn test_config(dir: &Path) -> Config {
        Config {
            base_port: 0,
            max_port_offset: 1,
            send_pacing_ms: 0,
            monitor_interval_ms: 20,
            stall_rearm_samples: 5,
            transfer: TransferConfig::in_dir(dir, 449),
            ..Config::default()
        }
    }

    async fn started(config: Config) -> PeerNode {
        let node = PeerNode::bind(config).await.unwrap();
        node.start().await.unwrap();
        node
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..300 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// A node connected to a fake directory listener; returns the directory's end of the socket.
    async fn with_directory(dir: &Path) -> (PeerNode, Config, TcpStream, ConnectionId) {
        let directory = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config(dir);
        config.directory_port = directory.local_addr().unwrap().port();
        let node = started(config.clone()).await;
        let id = node.connect_directory().await.unwrap();
        let (sock, _) = directory.accept().await.unwrap();
        (node, config, sock, id)
    }

    /// Read from `client` until `count` chunk frames have been decoded.
    async fn read_frames(client: &mut TcpStream, count: usize) -> Vec<p2pft_core::ChunkFrame> {
        let mut decoder = StreamDecoder::new();
        let mut frames = Vec::new();
        let mut buf = [0u8; 4096];
        while frames.len() < count {
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "node closed the connection");
            for item in decoder.push(&buf[..n]) {
                if let Inbound::Frame(bytes) = item {
                    frames.push(decode_chunk_frame(&bytes).unwrap().0);
                }
            }
        }
        frames
    }

    #[tokio::test]
    async fn exhausted_port_range_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let taken = TcpListener::bind((LISTEN_HOST, 0)).await.unwrap();
        let mut config = test_config(dir.path());
        config.base_port = taken.local_addr().unwrap().port();
        let err = PeerNode::bind(config).await.err().unwrap();
        assert!(matches!(err, NodeError::BindExhausted { .. }));
    }

    #[tokio::test]
    async fn bind_rejects_invalid_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.transfer.chunk_size = 0;
        assert!(matches!(PeerNode::bind(config).await, Err(NodeError::Config(_))));
    }

    #[tokio::test]
    async fn listener_is_listed_and_start_is_once() {
        let dir = tempfile::tempdir().unwrap();
        let node = started(test_config(dir.path())).await;
        let conns = node.connections().await;
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].id, LISTENER_ID);
        assert_eq!(conns[0].role, ConnectionRole::Listening);
        assert_ne!(node.public_port(), 0);
        assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn full_table_sends_busy_notice() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_connections = 1;
        let node = started(config).await;
        let addr = ("127.0.0.1", node.public_port());

        let _first = TcpStream::connect(addr).await.unwrap();
        wait_until(|| {
            let node = node.clone();
            async move { node.connection_count().await == 2 }
        })
        .await;
        let stamp = node.connections_last_modified().await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), second.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, protocol::BUSY_NOTICE.as_bytes());
        assert_eq!(node.connection_count().await, 2);
        assert_eq!(node.connections_last_modified().await, stamp);
    }

    #[tokio::test]
    async fn unknown_file_lookup_connects_nowhere() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _, mut directory, _) = with_directory(dir.path()).await;
        assert_eq!(node.handle_file_address(FileLookup::NotFound).await.unwrap(), 0);

        let answer = ControlMessage::FileAddress(FileLookup::NotFound).encode();
        directory.write_all(answer.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.connection_count().await, 2);
        assert!(node.downloads().await.is_empty());
        assert_eq!(node.queued_messages().await, 0);
    }

    #[tokio::test]
    async fn other_traffic_is_queued_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _, mut directory, dir_id) = with_directory(dir.path()).await;
        for text in ["File Listing:\r\n\t1\tsong.mp3\t2048", "Files added"] {
            directory.write_all(text.as_bytes()).await.unwrap();
            let msg = tokio::time::timeout(Duration::from_secs(5), node.next_message())
                .await
                .unwrap();
            assert_eq!(msg, QueuedMessage { connection: dir_id, text: text.to_string() });
        }
        assert_eq!(node.pop_message().await, None);
    }

    #[tokio::test]
    async fn queue_pops_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let node = PeerNode::bind(test_config(dir.path())).await.unwrap();
        node.enqueue(3, "a".into()).await;
        node.enqueue(1, "b".into()).await;
        node.enqueue(3, "c".into()).await;
        assert_eq!(node.queued_messages().await, 3);
        let order: Vec<String> = [
            node.pop_message().await,
            node.pop_message().await,
            Some(node.next_message().await),
        ]
        .into_iter()
        .flatten()
        .map(|m| m.text)
        .collect();
        assert_eq!(order, ["a", "b", "c"]);
        assert_eq!(node.queued_messages().await, 0);
    }

    #[tokio::test]
    async fn file_request_streams_the_range_back() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 253) as u8).collect();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, &content).unwrap();
        let node = started(test_config(&dir.path().join("data"))).await;
        assert_eq!(node.add_local_files(collect_files(&[path])).await, 1);

        let mut client = TcpStream::connect(("127.0.0.1", node.public_port())).await.unwrap();
        let request = ControlMessage::FileRequest {
            file_id: 9,
            name: "notes.txt".into(),
            size: 1000,
            start: 2,
            count: 0,
        };
        client.write_all(request.encode().as_bytes()).await.unwrap();

        let frames = read_frames(&mut client, 2).await;
        assert_eq!(frames[0].header.index, 2);
        assert_eq!(frames[1].header.index, 3);
        assert!(frames.iter().all(|f| f.header.file_id == 9 && f.verify().is_ok()));
        assert_eq!(frames[0].payload, content[449..898]);
        assert_eq!(frames[1].payload, content[898..]);
    }

    #[tokio::test]
    async fn unsolicited_chunks_are_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let node = started(test_config(dir.path())).await;
        let mut client = TcpStream::connect(("127.0.0.1", node.public_port())).await.unwrap();
        client.write_all(&encode_chunk_frame(77, 1, 1, b"hi")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!node.tracker().fragment_path(FragmentName::new(77, 1, 1)).exists());
        assert_eq!(node.queued_messages().await, 0);
    }

    #[tokio::test]
    async fn named_connections_close_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();
        let node = started(test_config(dir.path())).await;
        let a = node.connect("127.0.0.1", port, "7").await.unwrap();
        let b = node.connect("127.0.0.1", port, "7").await.unwrap();
        let (mut far_end, _) = peer.accept().await.unwrap();
        assert_eq!(node.connection_named("7").await, Some(b));
        assert!(node.peer_addr(a).await.is_some());

        assert_eq!(node.queue_close_by_name("7").await, 2);
        wait_until(|| {
            let node = node.clone();
            async move { !node.has_connection_named("7").await }
        })
        .await;
        let mut rest = Vec::new();
        far_end.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(matches!(node.close(a).await, Err(NodeError::UnknownConnection(_))));
        assert!(matches!(
            node.send_to_named("7", b"x").await,
            Err(NodeError::UnknownName(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_connect_failure() {
        let dir = tempfile::tempdir().unwrap();
        let node = started(test_config(dir.path())).await;
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);
        let err = node.connect("127.0.0.1", port, "x").await.unwrap_err();
        assert!(matches!(err, NodeError::ConnectFailure { .. }));
        assert_eq!(node.connection_count().await, 1);
    }

    #[tokio::test]
    async fn progress_reports_active_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let node = PeerNode::bind(test_config(&dir.path().join("data"))).await.unwrap();
        assert_eq!(node.file_progress().await.unwrap(), "You have no active file transfers.");
        node.add_download_files(vec![FileItem::new(4, "big.iso", 1000)]).await;
        assert_eq!(node.file_progress().await.unwrap(), "\tbig.iso\tWaiting for seeders...");
        node.tracker()
            .store_fragment(FragmentName::new(4, 1, 3), &[0u8; 449])
            .unwrap();
        assert_eq!(node.file_progress().await.unwrap(), "\tbig.iso\t449 of 1000 bytes");
    }

    #[tokio::test]
    async fn file_address_from_a_peer_is_only_queued() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _, _directory, _) = with_directory(dir.path()).await;
        let seeder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let answer = ControlMessage::FileAddress(FileLookup::Found {
            file_id: 3,
            name: "song.mp3".into(),
            size: 2048,
            peers: vec![PeerEndpoint::new("127.0.0.1", seeder.local_addr().unwrap().port())],
        })
        .encode();

        let mut stranger = TcpStream::connect(("127.0.0.1", node.public_port())).await.unwrap();
        stranger.write_all(answer.as_bytes()).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), node.next_message())
            .await
            .unwrap();
        assert_eq!(msg.text, answer);
        assert!(node.downloads().await.is_empty());
        assert!(
            tokio::time::timeout(Duration::from_millis(200), seeder.accept())
                .await
                .is_err(),
            "node dialed the advertised peer"
        );
        assert_eq!(node.connection_count().await, 3);
    }

    #[tokio::test]
    async fn oversized_file_address_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _, _directory, _) = with_directory(dir.path()).await;
        let seeder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let lookup = FileLookup::Found {
            file_id: 8,
            name: "huge.img".into(),
            size: u64::MAX,
            peers: vec![PeerEndpoint::new("127.0.0.1", seeder.local_addr().unwrap().port())],
        };
        assert_eq!(node.handle_file_address(lookup).await.unwrap(), 0);
        assert!(node.downloads().await.is_empty());
        assert_eq!(node.connection_count().await, 2);
    }

    #[tokio::test]
    async fn malformed_input_leaves_the_reactor_serving() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![7u8; 600];
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, &content).unwrap();
        let node = started(test_config(&dir.path().join("data"))).await;
        node.add_local_files(collect_files(&[path])).await;
        let addr = ("127.0.0.1", node.public_port());

        // a chunk header whose fields do not parse
        let mut bad_frame = b"fileTransfer\r\n".to_vec();
        bad_frame.extend_from_slice(&[b'x'; 47]);
        bad_frame.extend_from_slice(b"\r\n");
        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(&bad_frame).await.unwrap();

        // a fileRequest with missing and non-numeric fields
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"fileRequest\r\nnine\r\nnotes.txt").await.unwrap();

        wait_until(|| {
            let node = node.clone();
            async move { node.connection_count().await == 3 }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.queued_messages().await, 0);

        let mut third = TcpStream::connect(addr).await.unwrap();
        let request = ControlMessage::FileRequest {
            file_id: 4,
            name: "notes.txt".into(),
            size: 600,
            start: 1,
            count: 0,
        };
        third.write_all(request.encode().as_bytes()).await.unwrap();
        let frames = read_frames(&mut third, 2).await;
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.header.file_id == 4 && f.verify().is_ok()));
        assert_eq!(node.connection_count().await, 4);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn downloads_a_file_from_a_seeder() {
        let seed_dir = tempfile::tempdir().unwrap();
        let leech_dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..5000u32).map(|i| (i.wrapping_mul(7) % 256) as u8).collect();
        let source = seed_dir.path().join("payload.bin");
        std::fs::write(&source, &content).unwrap();

        let seeder = started(test_config(&seed_dir.path().join("data"))).await;
        seeder.add_local_files(collect_files(&[source])).await;

        let (leecher, config, mut directory, _) = with_directory(&leech_dir.path().join("data")).await;
        leecher.request_file(5).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = directory.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"getFile\r\n5");

        let answer = ControlMessage::FileAddress(FileLookup::Found {
            file_id: 5,
            name: "payload.bin".into(),
            size: 5000,
            peers: vec![PeerEndpoint::new("127.0.0.1", seeder.public_port())],
        });
        directory.write_all(answer.encode().as_bytes()).await.unwrap();

        let mut monitor = TransferMonitor::new(leecher.clone(), &config);
        let mut completed = false;
        for _ in 0..300 {
            if monitor.sample().await.unwrap().completed.contains(&5) {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(completed, "download did not complete");

        let item = leecher.local_file("payload.bin", 5000).await.unwrap();
        assert!(item.completed);
        assert_eq!(std::fs::read(&item.path).unwrap(), content);
        assert!(!leecher.has_download_file("payload.bin", 5000).await);

        // completion is announced to the directory
        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains("addFiles\r\n") {
            let n = tokio::time::timeout(Duration::from_secs(5), directory.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0);
            seen.extend_from_slice(&buf[..n]);
        }
        assert!(String::from_utf8_lossy(&seen).contains("payload.bin\t5000\t"));

        // and the transfer connection is closed
        wait_until(|| {
            let leecher = leecher.clone();
            async move { !leecher.has_connection_named("5").await }
        })
        .await;
        leecher.shutdown().await;
        seeder.shutdown().await;
    }
}
