//! RepliKV replica-to-replica TCP transport module implementation.
//!
//! NOTE: In concept, all messages are sent through unstable communication
//! channels, and are retried if the sender did not receive an ACK in a timely
//! manner. Here, we use TCP as the communication protocol to get the same
//! effect of "every message a sender wants to send will be retried until
//! eventually delivered", plus in-order delivery per peer pair.

use std::fmt;
use std::net::SocketAddr;

use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
    RepliKvError,
};
use crate::{logged_err, pf_debug, pf_error, pf_trace, pf_warn};

use bytes::BytesMut;

use serde::{de::DeserializeOwned, Serialize};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Replica ID type. The primary is always 0; inbound subscribers are handed
/// IDs 1, 2, ... in connection order.
pub type ReplicaId = u8;

/// Replica-to-replica TCP transport module.
pub(crate) struct TransportHub<Msg> {
    /// Log line prefix (the node's role string).
    me: &'static str,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(ReplicaId, Msg)>,

    /// Map from peer ID -> sender side of the send channel, shared with the
    /// peer acceptor task.
    tx_sends: flashmap::ReadHandle<ReplicaId, mpsc::UnboundedSender<Msg>>,

    /// Join handle of the peer acceptor task.
    _peer_acceptor_handle: JoinHandle<()>,

    /// Sender side of the connect channel, used when proactively connecting
    /// to some peer.
    tx_connect: mpsc::UnboundedSender<(ReplicaId, SocketAddr)>,

    /// Receiver side of the connack channel, used when proactively
    /// connecting to some peer.
    rx_connack: mpsc::UnboundedReceiver<ReplicaId>,

    /// Map from peer ID -> peer messenger task join handles, shared with
    /// the peer acceptor task.
    _peer_messenger_handles: flashmap::ReadHandle<ReplicaId, JoinHandle<()>>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates a new transport hub. Binds the peer listener socket and
    /// spawns the peer acceptor task. Creates a recv channel for listening
    /// on peers' messages.
    pub(crate) async fn new_and_setup(
        me: &'static str,
        p2p_addr: SocketAddr,
    ) -> Result<Self, RepliKvError> {
        let (tx_recv, rx_recv) =
            mpsc::unbounded_channel::<(ReplicaId, Msg)>();

        let (tx_sends_write, tx_sends_read) =
            flashmap::new::<ReplicaId, mpsc::UnboundedSender<Msg>>();

        let (peer_messenger_handles_write, peer_messenger_handles_read) =
            flashmap::new::<ReplicaId, JoinHandle<()>>();

        // the connect & connack channels are used to ask the peer acceptor
        // task to proactively connect to some peer
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, rx_connack) = mpsc::unbounded_channel();

        let peer_listener = tcp_bind_with_retry(p2p_addr, 10).await?;
        let mut acceptor = TransportHubAcceptorTask::new(
            me,
            tx_recv,
            peer_listener,
            tx_sends_write,
            peer_messenger_handles_write,
            rx_connect,
            tx_connack,
        );
        let peer_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(TransportHub {
            me,
            rx_recv,
            tx_sends: tx_sends_read,
            _peer_acceptor_handle: peer_acceptor_handle,
            tx_connect,
            rx_connack,
            _peer_messenger_handles: peer_messenger_handles_read,
        })
    }

    /// Connects to a peer replica proactively, filing the connection under
    /// the given peer ID, and spawns the corresponding messenger task.
    pub(crate) async fn connect_to_peer(
        &mut self,
        id: ReplicaId,
        peer_addr: SocketAddr,
    ) -> Result<(), RepliKvError> {
        self.tx_connect
            .send((id, peer_addr))
            .map_err(RepliKvError::msg)?;
        match self.rx_connack.recv().await {
            Some(ack_id) => {
                if ack_id != id {
                    logged_err!(
                        self.me;
                        "peer ID mismatch: expected {}, got {}",
                        id,
                        ack_id
                    )
                } else {
                    Ok(())
                }
            }
            None => logged_err!(self.me; "connack channel closed"),
        }
    }

    /// Sends a message to a specified peer by sending to the send channel.
    /// A message to a peer that is not (or no longer) connected is dropped;
    /// the core never retries.
    pub(crate) fn send_msg(
        &mut self,
        msg: Msg,
        peer: ReplicaId,
    ) -> Result<(), RepliKvError> {
        let tx_sends_guard = self.tx_sends.guard();
        match tx_sends_guard.get(&peer) {
            Some(tx_send) => {
                tx_send.send(msg).map_err(RepliKvError::msg)?;
            }
            None => {
                pf_debug!(self.me; "peer {} not connected, dropping message",
                                   peer);
            }
        }

        Ok(())
    }

    /// Broadcasts a message to the given peers by sending to their send
    /// channels.
    pub(crate) fn bcast_msg(
        &mut self,
        msg: Msg,
        targets: &[ReplicaId],
    ) -> Result<(), RepliKvError> {
        for &peer in targets {
            self.send_msg(msg.clone(), peer)?;
        }
        Ok(())
    }

    /// Receives a message from some peer by receiving from the recv channel.
    /// Returns a pair of `(peer_id, msg)` on success.
    pub(crate) async fn recv_msg(
        &mut self,
    ) -> Result<(ReplicaId, Msg), RepliKvError> {
        match self.rx_recv.recv().await {
            Some((id, msg)) => Ok((id, msg)),
            None => logged_err!(self.me; "recv channel has been closed"),
        }
    }
}

/// TransportHub peer acceptor task.
struct TransportHubAcceptorTask<Msg> {
    me: &'static str,

    tx_recv: mpsc::UnboundedSender<(ReplicaId, Msg)>,
    tx_sends: flashmap::WriteHandle<ReplicaId, mpsc::UnboundedSender<Msg>>,

    peer_listener: TcpListener,
    peer_messenger_handles: flashmap::WriteHandle<ReplicaId, JoinHandle<()>>,

    rx_connect: mpsc::UnboundedReceiver<(ReplicaId, SocketAddr)>,
    tx_connack: mpsc::UnboundedSender<ReplicaId>,

    /// Next ID to hand to an inbound connection; 0 is reserved for the peer
    /// this node dials out to (the primary, from a backup's perspective).
    next_accept_id: ReplicaId,

    tx_exit: mpsc::UnboundedSender<ReplicaId>,
    rx_exit: mpsc::UnboundedReceiver<ReplicaId>,
}

impl<Msg> TransportHubAcceptorTask<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates the peer acceptor task.
    fn new(
        me: &'static str,
        tx_recv: mpsc::UnboundedSender<(ReplicaId, Msg)>,
        peer_listener: TcpListener,
        tx_sends: flashmap::WriteHandle<
            ReplicaId,
            mpsc::UnboundedSender<Msg>,
        >,
        peer_messenger_handles: flashmap::WriteHandle<
            ReplicaId,
            JoinHandle<()>,
        >,
        rx_connect: mpsc::UnboundedReceiver<(ReplicaId, SocketAddr)>,
        tx_connack: mpsc::UnboundedSender<ReplicaId>,
    ) -> Self {
        // create an exit mpsc channel for getting notified about termination
        // of peer messenger tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        TransportHubAcceptorTask {
            me,
            tx_recv,
            peer_listener,
            tx_sends,
            peer_messenger_handles,
            rx_connect,
            tx_connack,
            next_accept_id: 1,
            tx_exit,
            rx_exit,
        }
    }

    /// Spawns a messenger task for a newly established peer connection.
    fn spawn_messenger(
        &mut self,
        id: ReplicaId,
        addr: SocketAddr,
        stream: TcpStream,
    ) -> Result<(), RepliKvError> {
        let mut peer_messenger_handles_guard =
            self.peer_messenger_handles.guard();
        if peer_messenger_handles_guard.contains_key(&id) {
            return logged_err!(self.me; "duplicate peer ID: {}", id);
        }

        let mut tx_sends_guard = self.tx_sends.guard();
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);

        let mut messenger = TransportHubMessengerTask::new(
            self.me,
            id,
            addr,
            stream,
            rx_send,
            self.tx_recv.clone(),
            self.tx_exit.clone(),
        );
        let peer_messenger_handle =
            tokio::spawn(async move { messenger.run().await });
        peer_messenger_handles_guard.insert(id, peer_messenger_handle);

        Ok(())
    }

    /// Connects to a peer proactively.
    async fn connect_new_peer(
        &mut self,
        id: ReplicaId,
        conn_addr: SocketAddr,
    ) -> Result<(), RepliKvError> {
        pf_debug!(self.me; "connecting to peer {} '{}'...", id, conn_addr);
        let stream = tcp_connect_with_retry(conn_addr, 10).await?;

        self.spawn_messenger(id, conn_addr, stream)?;
        pf_debug!(self.me; "connected to peer {}", id);
        Ok(())
    }

    /// Accepts a new peer connection, handing it the next inbound ID.
    fn accept_new_peer(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), RepliKvError> {
        let id = self.next_accept_id;
        self.next_accept_id = self.next_accept_id.wrapping_add(1);

        self.spawn_messenger(id, addr, stream)?;
        pf_debug!(self.me; "accepted peer {} from '{}'", id, addr);
        Ok(())
    }

    /// Removes handles of a left peer connection.
    fn remove_left_peer(
        &mut self,
        id: ReplicaId,
    ) -> Result<(), RepliKvError> {
        let mut tx_sends_guard = self.tx_sends.guard();
        if !tx_sends_guard.contains_key(&id) {
            return logged_err!(self.me; "peer {} not found among connected ones", id);
        }
        tx_sends_guard.remove(id);

        let mut peer_messenger_handles_guard =
            self.peer_messenger_handles.guard();
        peer_messenger_handles_guard.remove(id);

        Ok(())
    }

    /// Starts the peer acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "peer_acceptor task spawned");

        loop {
            tokio::select! {
                // proactive connection request
                to_connect = self.rx_connect.recv() => {
                    if to_connect.is_none() {
                        // channel gets closed and no messages remain
                        break;
                    }
                    let (peer, conn_addr) = to_connect.unwrap();
                    if let Err(e) = self.connect_new_peer(
                        peer,
                        conn_addr,
                    ).await {
                        pf_error!(self.me; "error connecting to new peer: {}", e);
                    } else if let Err(e) = self.tx_connack.send(peer) {
                        pf_error!(self.me; "error sending to tx_connack: {}", e);
                    }
                },

                // new peer connection accepted
                accepted = self.peer_listener.accept() => {
                    if let Err(e) = accepted {
                        pf_warn!(self.me; "error accepting peer connection: {}", e);
                        continue;
                    }
                    let (stream, addr) = accepted.unwrap();
                    if let Err(e) = self.accept_new_peer(
                        stream,
                        addr,
                    ) {
                        pf_error!(self.me; "error accepting new peer: {}", e);
                    }
                },

                // a peer messenger task exits
                id = self.rx_exit.recv() => {
                    let id = id.unwrap();
                    if let Err(e) = self.remove_left_peer(id) {
                        pf_error!(self.me; "error removing left peer {}: {}", id, e);
                    }
                },
            }
        }

        pf_debug!(self.me; "peer_acceptor task exited");
    }
}

/// TransportHub per-peer messenger task.
struct TransportHubMessengerTask<Msg> {
    me: &'static str,

    /// Corresponding peer's ID.
    id: ReplicaId,
    /// Corresponding peer's address.
    addr: SocketAddr,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    rx_send: mpsc::UnboundedReceiver<Msg>,
    read_buf: BytesMut,

    tx_recv: mpsc::UnboundedSender<(ReplicaId, Msg)>,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<ReplicaId>,
}

// TransportHub peer_messenger task implementation
impl<Msg> TransportHubMessengerTask<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates a per-peer messenger task.
    fn new(
        me: &'static str,
        id: ReplicaId,
        addr: SocketAddr,
        conn: TcpStream,
        rx_send: mpsc::UnboundedReceiver<Msg>,
        tx_recv: mpsc::UnboundedSender<(ReplicaId, Msg)>,
        tx_exit: mpsc::UnboundedSender<ReplicaId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        let read_buf = BytesMut::with_capacity(8 + 1024);
        let write_buf = BytesMut::with_capacity(8 + 1024);
        let write_buf_cursor = 0;
        let retrying = false;

        TransportHubMessengerTask {
            me,
            id,
            addr,
            conn_read,
            conn_write,
            rx_send,
            read_buf,
            tx_recv,
            write_buf,
            write_buf_cursor,
            retrying,
            tx_exit,
        }
    }

    /// Writes a message through given TcpStream.
    /// This is a non-method function to ease `tokio::select!` sharing.
    fn write_msg(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        msg: Option<&Msg>,
    ) -> Result<bool, RepliKvError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, msg)
    }

    /// Reads a message from given TcpStream.
    /// This is a non-method function to ease `tokio::select!` sharing.
    async fn read_msg(
        // first 8 bytes being the message length, and the rest bytes being
        // the message itself
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<Msg, RepliKvError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Starts a per-peer messenger task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "peer_messenger task for {} '{}' spawned",
                           self.id, self.addr);

        loop {
            tokio::select! {
                // gets a message to send out
                msg = self.rx_send.recv(), if !self.retrying => {
                    match msg {
                        Some(msg) => {
                            match Self::write_msg(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&msg),
                            ) {
                                Ok(true) => {
                                    pf_trace!(self.me; "sent -> {} msg {:?}",
                                                       self.id, msg);
                                }
                                Ok(false) => {
                                    pf_debug!(self.me; "should start retrying msg send -> {}",
                                                       self.id);
                                    self.retrying = true;
                                }
                                Err(e) => {
                                    pf_error!(self.me; "error sending -> {}: {}",
                                                       self.id, e);
                                }
                            }
                        },
                        None => break, // channel gets closed and no messages remain
                    }
                },

                // retrying last unsuccessful send
                _ = self.conn_write.writable(), if self.retrying => {
                    match Self::write_msg(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            pf_debug!(self.me; "finished retrying last msg send -> {}",
                                               self.id);
                            self.retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!(self.me; "still should retry last msg send -> {}",
                                               self.id);
                        }
                        Err(e) => {
                            pf_error!(self.me; "error retrying last msg send -> {}: {}",
                                               self.id, e);
                        }
                    }
                },

                // receives new message from peer
                msg = Self::read_msg(&mut self.read_buf, &mut self.conn_read) => {
                    match msg {
                        Ok(msg) => {
                            pf_trace!(self.me; "recv <- {} msg {:?}", self.id, msg);
                            if let Err(e) = self.tx_recv.send((self.id, msg)) {
                                pf_error!(self.me; "error sending to tx_recv for {}: {}",
                                                   self.id, e);
                            }
                        },
                        Err(_e) => {
                            break; // probably the peer exited ungracefully
                        }
                    }
                }
            }
        }

        if let Err(e) = self.tx_exit.send(self.id) {
            pf_error!(self.me; "error sending exit signal for {}: {}",
                               self.id, e);
        }
        pf_debug!(self.me; "peer_messenger task for {} '{}' exited",
                           self.id, self.addr);
    }
}
