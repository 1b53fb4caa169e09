/*!
 * @file async_client.rs
 * @brief Event-loop-driven controller: pending-callback queue, hook
 * dispatch, connect/read/write handlers, shutdown orchestration (component F)
 */

use std::any::Any;
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::codec::message;
use crate::codec::Reply;
use crate::connection::{Connection, ConnectionFlags};
use crate::error::{MongoError, Result};
use crate::wire::{DeleteFlags, InsertFlags, QueryFlags, UpdateFlags};

/// The five readiness/cleanup hooks an external event loop must supply.
/// This is the sole boundary between the controller and whatever reactor
/// the embedding application runs (mio, epoll directly, an FFI loop) — no
/// reactor type is named anywhere else in this module.
pub trait EventLoopHooks: Send {
    fn add_read(&mut self);
    fn del_read(&mut self);
    fn add_write(&mut self);
    fn del_write(&mut self);
    fn cleanup(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Ok,
    Err,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectStatus {
    Ok,
    Err,
}

/// What a reply callback asks the controller to do once it returns. This
/// replaces the original's `IN_CALLBACK`+`FREEING` flag dance: since a
/// callback here never holds a live reference to the controller while it
/// runs, there's no reentrancy hazard to guard against — the dispatch site
/// just acts on the disposition once the callback call has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Disconnect,
    Free,
}

pub type ReplyCallback =
    Box<dyn FnMut(Option<&Reply>, &mut (dyn Any + Send)) -> Disposition + Send>;

struct PendingCallback {
    callback: ReplyCallback,
    privdata: Box<dyn Any + Send>,
    flags: QueryFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    Init,
    Connecting,
    Open,
    Draining,
    Failing,
    Closed,
}

enum ConnectOutcome {
    AlreadyConnected,
    JustConnected,
    StillConnecting,
    Failed,
}

pub struct AsyncClient {
    connection: Connection,
    hooks: Box<dyn EventLoopHooks>,
    on_connect: Option<Box<dyn FnMut(ConnectStatus) + Send>>,
    on_disconnect: Option<Box<dyn FnMut(DisconnectStatus) + Send>>,
    pending: VecDeque<PendingCallback>,
    state: ControllerState,
    mirrored_error: Option<(i32, String)>,
}

impl AsyncClient {
    pub fn new(connection: Connection, hooks: Box<dyn EventLoopHooks>) -> Self {
        let state = if connection.flags().contains(ConnectionFlags::CONNECTED) {
            ControllerState::Open
        } else {
            ControllerState::Connecting
        };
        let mut client = AsyncClient {
            connection,
            hooks,
            on_connect: None,
            on_disconnect: None,
            pending: VecDeque::new(),
            state,
            mirrored_error: None,
        };
        client.hooks.add_write();
        client
    }

    pub fn set_connect_callback(&mut self, cb: Box<dyn FnMut(ConnectStatus) + Send>) {
        self.on_connect = Some(cb);
    }

    pub fn set_disconnect_callback(&mut self, cb: Box<dyn FnMut(DisconnectStatus) + Send>) {
        self.on_disconnect = Some(cb);
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn error(&self) -> Option<&(i32, String)> {
        self.mirrored_error.as_ref()
    }

    fn fire_connect(&mut self, status: ConnectStatus) {
        if let Some(cb) = self.on_connect.as_mut() {
            cb(status);
        }
    }

    fn fire_disconnect(&mut self, status: DisconnectStatus) {
        if let Some(cb) = self.on_disconnect.as_mut() {
            cb(status);
        }
    }

    fn check_submit_allowed(&self) -> Result<()> {
        if self
            .connection
            .flags()
            .intersects(ConnectionFlags::DISCONNECTING | ConnectionFlags::FREEING)
        {
            return Err(MongoError::Other(
                "request rejected: connection is shutting down".into(),
            ));
        }
        Ok(())
    }

    /// Diagnoses a pending non-blocking connect via `check_socket_error`
    /// (shared by the write and read handlers).
    fn confirm_connect(&mut self) -> ConnectOutcome {
        if self.connection.flags().contains(ConnectionFlags::CONNECTED) {
            return ConnectOutcome::AlreadyConnected;
        }
        match self.connection.check_socket_error() {
            Ok(()) => {
                *self.connection.flags_mut() |= ConnectionFlags::CONNECTED;
                self.state = ControllerState::Open;
                tracing::debug!(fd = self.connection.as_raw_fd(), "connect confirmed");
                self.fire_connect(ConnectStatus::Ok);
                ConnectOutcome::JustConnected
            }
            Err(MongoError::Io(e)) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                ConnectOutcome::StillConnecting
            }
            Err(e) => {
                tracing::warn!(error = %e, "connect failed");
                self.fire_connect(ConnectStatus::Err);
                self.fail(e);
                ConnectOutcome::Failed
            }
        }
    }

    /// Write handler: called on write-readiness.
    pub fn handle_write(&mut self) -> Result<()> {
        match self.confirm_connect() {
            ConnectOutcome::StillConnecting | ConnectOutcome::Failed => return Ok(()),
            ConnectOutcome::AlreadyConnected | ConnectOutcome::JustConnected => {}
        }
        match self.connection.buffer_write() {
            Ok(true) => self.hooks.del_write(),
            Ok(false) => self.hooks.add_write(),
            Err(e) => {
                self.fail(e);
                return Ok(());
            }
        }
        self.hooks.add_read();
        Ok(())
    }

    /// Read handler: called on read-readiness.
    pub fn handle_read(&mut self) -> Result<()> {
        match self.confirm_connect() {
            ConnectOutcome::StillConnecting | ConnectOutcome::Failed => return Ok(()),
            ConnectOutcome::AlreadyConnected | ConnectOutcome::JustConnected => {}
        }
        if let Err(e) = self.connection.buffer_read() {
            self.fail(e);
            return Ok(());
        }
        self.hooks.add_read();
        self.process_callbacks()
    }

    /// The dispatch loop: extracts as many
    /// replies as are fully buffered and invokes the matching callback for
    /// each, honoring the EXHAUST pop/peek policy.
    pub fn process_callbacks(&mut self) -> Result<()> {
        loop {
            let reply = match self.connection.reader().poll() {
                Ok(Some(r)) => r,
                Ok(None) => {
                    if self.state == ControllerState::Draining
                        && self.pending.is_empty()
                        && !self.connection.has_pending_output()
                    {
                        self.state = ControllerState::Closed;
                        self.hooks.cleanup();
                        self.fire_disconnect(DisconnectStatus::Ok);
                    }
                    return Ok(());
                }
                Err(e) => {
                    self.fail(e);
                    return Ok(());
                }
            };

            let retain_for_exhaust = self
                .pending
                .front()
                .map(|pc| pc.flags.contains(QueryFlags::EXHAUST) && reply.cursor_id() != 0)
                .unwrap_or(false);

            let disposition = if retain_for_exhaust {
                let pc = self.pending.front_mut().expect("checked above");
                self.connection.flags_mut().insert(ConnectionFlags::IN_CALLBACK);
                let d = (pc.callback)(Some(&reply), pc.privdata.as_mut());
                self.connection.flags_mut().remove(ConnectionFlags::IN_CALLBACK);
                d
            } else if let Some(mut pc) = self.pending.pop_front() {
                self.connection.flags_mut().insert(ConnectionFlags::IN_CALLBACK);
                let d = (pc.callback)(Some(&reply), pc.privdata.as_mut());
                self.connection.flags_mut().remove(ConnectionFlags::IN_CALLBACK);
                d
            } else {
                // No callback queued for this reply (e.g. an unsolicited
                // monitor-mode message). Drop it and keep going.
                continue;
            };

            match disposition {
                Disposition::Continue => {}
                Disposition::Disconnect => self.disconnect(),
                Disposition::Free => self.free(),
            }
            if self.state == ControllerState::Closed {
                return Ok(());
            }
        }
    }

    fn flush_pending_with_null(&mut self) {
        while let Some(mut pc) = self.pending.pop_front() {
            self.connection.flags_mut().insert(ConnectionFlags::IN_CALLBACK);
            let _ = (pc.callback)(None, pc.privdata.as_mut());
            self.connection.flags_mut().remove(ConnectionFlags::IN_CALLBACK);
        }
    }

    fn fail(&mut self, err: MongoError) {
        tracing::error!(code = err.code(), message = %err.message(), "connection failed");
        self.mirrored_error = Some((err.code(), err.message()));
        self.connection.set_error(err);
        self.state = ControllerState::Failing;
        // Mirrors __mongoAsyncDisconnect's error path: DISCONNECTING goes up
        // before the flush so check_submit_allowed rejects anything a
        // callback submits while pending replies are being drained with null.
        *self.connection.flags_mut() |= ConnectionFlags::DISCONNECTING;
        self.flush_pending_with_null();
        self.state = ControllerState::Closed;
        self.hooks.cleanup();
        self.fire_disconnect(DisconnectStatus::Err);
    }

    /// `asyncDisconnect` (clean shutdown).
    pub fn disconnect(&mut self) {
        match self.state {
            ControllerState::Open => {
                *self.connection.flags_mut() |= ConnectionFlags::DISCONNECTING;
                if self.pending.is_empty() && !self.connection.has_pending_output() {
                    self.state = ControllerState::Closed;
                    self.hooks.cleanup();
                    self.fire_disconnect(DisconnectStatus::Ok);
                } else {
                    self.state = ControllerState::Draining;
                    tracing::debug!("draining pending callbacks before close");
                }
            }
            ControllerState::Init | ControllerState::Connecting => {
                *self.connection.flags_mut() |= ConnectionFlags::DISCONNECTING;
                self.state = ControllerState::Closed;
                self.hooks.cleanup();
                self.fire_disconnect(DisconnectStatus::Ok);
            }
            ControllerState::Draining | ControllerState::Failing | ControllerState::Closed => {}
        }
    }

    /// `asyncFree` (immediate destruction). Flushes pending callbacks with
    /// a null reply, calls `cleanup`, then fires `onDisconnect(Ok)` if the
    /// connection had reached `CONNECTED` — mirroring the original's
    /// `__mongoAsyncFree` guard (`ac->onDisconnect && (c->flags &
    /// MONGO_CONNECTED)`).
    pub fn free(&mut self) {
        *self.connection.flags_mut() |= ConnectionFlags::FREEING;
        let was_connected = self.connection.flags().contains(ConnectionFlags::CONNECTED);
        self.flush_pending_with_null();
        self.state = ControllerState::Closed;
        self.hooks.cleanup();
        if was_connected {
            self.fire_disconnect(DisconnectStatus::Ok);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == ControllerState::Closed
    }

    fn enqueue_write_callback(
        &mut self,
        db: &str,
        callback: Option<ReplyCallback>,
        privdata: Box<dyn Any + Send>,
    ) -> Result<()> {
        if let Some(cb) = callback {
            let gle_id = self.connection.next_request_id();
            let frame = message::build_get_last_error(gle_id, db)?;
            self.connection.append_formatted(&frame)?;
            self.pending.push_back(PendingCallback {
                callback: cb,
                privdata,
                flags: QueryFlags::empty(),
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn query(
        &mut self,
        db: &str,
        col: &str,
        flags: QueryFlags,
        number_to_skip: i32,
        number_to_return: i32,
        query: &[u8],
        return_fields_selector: Option<&[u8]>,
        callback: Option<ReplyCallback>,
        privdata: Box<dyn Any + Send>,
    ) -> Result<()> {
        self.check_submit_allowed()?;
        let request_id = self.connection.next_request_id();
        let frame = message::build_query(
            request_id,
            flags,
            db,
            col,
            number_to_skip,
            number_to_return,
            query,
            return_fields_selector,
        )?;
        self.connection.append_formatted(&frame)?;
        if let Some(cb) = callback {
            self.pending.push_back(PendingCallback {
                callback: cb,
                privdata,
                flags,
            });
        }
        self.hooks.add_write();
        Ok(())
    }

    /// `find_one`: convenience wrapper over `query` (nrSkip=0, nrReturn=-1,
    /// no EXHAUST). SUPPLEMENTED from the original's `mongoAsyncFindOne`;
    /// not a new wire operation.
    pub fn find_one(
        &mut self,
        db: &str,
        col: &str,
        query: &[u8],
        callback: Option<ReplyCallback>,
        privdata: Box<dyn Any + Send>,
    ) -> Result<()> {
        self.query(
            db,
            col,
            QueryFlags::empty(),
            0,
            -1,
            query,
            None,
            callback,
            privdata,
        )
    }

    /// `find_all`: convenience wrapper over `query` (nrSkip=0, EXHAUST
    /// forced on, `nr_per_query` forwarded as `numberToReturn`).
    /// SUPPLEMENTED from the original's `mongoAsyncFindAll`.
    pub fn find_all(
        &mut self,
        db: &str,
        col: &str,
        query: &[u8],
        nr_per_query: i32,
        callback: Option<ReplyCallback>,
        privdata: Box<dyn Any + Send>,
    ) -> Result<()> {
        self.query(
            db,
            col,
            QueryFlags::EXHAUST,
            0,
            nr_per_query,
            query,
            None,
            callback,
            privdata,
        )
    }

    pub fn insert(
        &mut self,
        db: &str,
        col: &str,
        flags: InsertFlags,
        docs: &[&[u8]],
        callback: Option<ReplyCallback>,
        privdata: Box<dyn Any + Send>,
    ) -> Result<()> {
        self.check_submit_allowed()?;
        let request_id = self.connection.next_request_id();
        let frame = message::build_insert(request_id, flags, db, col, docs)?;
        self.connection.append_formatted(&frame)?;
        self.enqueue_write_callback(db, callback, privdata)?;
        self.hooks.add_write();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        db: &str,
        col: &str,
        flags: UpdateFlags,
        selector: &[u8],
        update: &[u8],
        callback: Option<ReplyCallback>,
        privdata: Box<dyn Any + Send>,
    ) -> Result<()> {
        self.check_submit_allowed()?;
        let request_id = self.connection.next_request_id();
        let frame = message::build_update(request_id, db, col, flags, selector, update)?;
        self.connection.append_formatted(&frame)?;
        self.enqueue_write_callback(db, callback, privdata)?;
        self.hooks.add_write();
        Ok(())
    }

    pub fn delete(
        &mut self,
        db: &str,
        col: &str,
        flags: DeleteFlags,
        selector: &[u8],
        callback: Option<ReplyCallback>,
        privdata: Box<dyn Any + Send>,
    ) -> Result<()> {
        self.check_submit_allowed()?;
        let request_id = self.connection.next_request_id();
        let frame = message::build_delete(request_id, db, col, flags, selector)?;
        self.connection.append_formatted(&frame)?;
        self.enqueue_write_callback(db, callback, privdata)?;
        self.hooks.add_write();
        Ok(())
    }

    pub fn kill_cursors(
        &mut self,
        db: &str,
        cursor_ids: &[i64],
        callback: Option<ReplyCallback>,
        privdata: Box<dyn Any + Send>,
    ) -> Result<()> {
        self.check_submit_allowed()?;
        let request_id = self.connection.next_request_id();
        let frame = message::build_kill_cursors(request_id, cursor_ids)?;
        self.connection.append_formatted(&frame)?;
        self.enqueue_write_callback(db, callback, privdata)?;
        self.hooks.add_write();
        Ok(())
    }

    /// `get_more` has a real OP_REPLY, unlike the other write ops, so its
    /// callback is enqueued directly rather than against a synthesized
    /// `getLastError`.
    pub fn get_more(
        &mut self,
        db: &str,
        col: &str,
        number_to_return: i32,
        cursor_id: i64,
        callback: Option<ReplyCallback>,
        privdata: Box<dyn Any + Send>,
    ) -> Result<()> {
        self.check_submit_allowed()?;
        let request_id = self.connection.next_request_id();
        let frame = message::build_get_more(request_id, db, col, number_to_return, cursor_id)?;
        self.connection.append_formatted(&frame)?;
        if let Some(cb) = callback {
            self.pending.push_back(PendingCallback {
                callback: cb,
                privdata,
                flags: QueryFlags::empty(),
            });
        }
        self.hooks.add_write();
        Ok(())
    }
}

impl AsRawFd for AsyncClient {
    fn as_raw_fd(&self) -> RawFd {
        self.connection.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pack::{pack_append, PackArg};
    use std::os::unix::net::UnixStream;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingHooks {
        add_read: u32,
        del_read: u32,
        add_write: u32,
        del_write: u32,
        cleanup: u32,
    }

    struct SharedHooks(Arc<Mutex<RecordingHooks>>);

    impl EventLoopHooks for SharedHooks {
        fn add_read(&mut self) {
            self.0.lock().unwrap().add_read += 1;
        }
        fn del_read(&mut self) {
            self.0.lock().unwrap().del_read += 1;
        }
        fn add_write(&mut self) {
            self.0.lock().unwrap().add_write += 1;
        }
        fn del_write(&mut self) {
            self.0.lock().unwrap().del_write += 1;
        }
        fn cleanup(&mut self) {
            self.0.lock().unwrap().cleanup += 1;
        }
    }

    fn test_client() -> (AsyncClient, Arc<Mutex<RecordingHooks>>, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let socket = socket2::Socket::from(a);
        let connection = Connection::new(
            socket,
            crate::connection::ConnectionKind::Local {
                path: "test".into(),
            },
            crate::config::ConnectOptions::new(),
            ConnectionFlags::CONNECTED,
        );
        let recorder = Arc::new(Mutex::new(RecordingHooks::default()));
        let hooks = Box::new(SharedHooks(recorder.clone()));
        (AsyncClient::new(connection, hooks), recorder, b)
    }

    fn sample_reply_frame(cursor_id: i64, docs: &[&[u8]]) -> Vec<u8> {
        let mut body = pack_append(
            "<iqii",
            &[
                PackArg::U32(0),
                PackArg::U64(cursor_id as u64),
                PackArg::U32(0),
                PackArg::U32(docs.len() as u32),
            ],
        );
        for d in docs {
            body.extend_from_slice(d);
        }
        let message_length = (16 + body.len()) as u32;
        let mut frame = pack_append(
            "<iiii",
            &[
                PackArg::U32(message_length),
                PackArg::U32(1),
                PackArg::U32(0),
                PackArg::U32(1),
            ],
        );
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn exhaust_cursor_retains_single_callback_across_two_replies() {
        use std::io::Write;

        let (mut client, _hooks, mut peer) = test_client();
        let invocations = Arc::new(Mutex::new(Vec::new()));
        let inv = invocations.clone();

        let query = bson::to_vec(&bson::doc! { "ping": 1 }).unwrap();
        client
            .query(
                "db",
                "col",
                QueryFlags::EXHAUST,
                0,
                0,
                &query,
                None,
                Some(Box::new(move |reply: Option<&Reply>, _: &mut (dyn Any + Send)| {
                    inv.lock().unwrap().push(reply.map(|r| r.cursor_id()));
                    Disposition::Continue
                })),
                Box::new(()),
            )
            .unwrap();

        let doc = bson::to_vec(&bson::doc! { "n": 1 }).unwrap();
        let first = sample_reply_frame(42, &[&doc]);
        let second = sample_reply_frame(0, &[]);

        peer.write_all(&first).unwrap();
        client.connection.buffer_read().unwrap();
        client.process_callbacks().unwrap();

        peer.write_all(&second).unwrap();
        client.connection.buffer_read().unwrap();
        client.process_callbacks().unwrap();

        let calls = invocations.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], Some(42));
        assert_eq!(calls[1], Some(0));
        assert!(client.pending.is_empty());
    }

    #[test]
    fn insert_without_callback_appends_no_get_last_error() {
        let (mut client, _hooks, _peer) = test_client();
        let doc = bson::to_vec(&bson::doc! { "x": 1 }).unwrap();
        client
            .insert("db", "col", InsertFlags::empty(), &[&doc], None, Box::new(()))
            .unwrap();
        assert!(client.pending.is_empty());
    }

    #[test]
    fn insert_with_callback_enqueues_against_get_last_error() {
        let (mut client, _hooks, _peer) = test_client();
        let doc = bson::to_vec(&bson::doc! { "x": 1 }).unwrap();
        client
            .insert(
                "db",
                "col",
                InsertFlags::empty(),
                &[&doc],
                Some(Box::new(|_: Option<&Reply>, _: &mut (dyn Any + Send)| {
                    Disposition::Continue
                })),
                Box::new(()),
            )
            .unwrap();
        assert_eq!(client.pending.len(), 1);
    }

    #[test]
    fn submit_during_disconnecting_is_rejected_without_touching_buffer() {
        let (mut client, _hooks, _peer) = test_client();
        *client.connection.flags_mut() |= ConnectionFlags::DISCONNECTING;
        let before = client.connection.has_pending_output();
        let query = bson::to_vec(&bson::doc! {}).unwrap();
        let err = client
            .query("db", "col", QueryFlags::empty(), 0, 0, &query, None, None, Box::new(()))
            .unwrap_err();
        assert!(matches!(err, MongoError::Other(_)));
        assert_eq!(before, client.connection.has_pending_output());
    }

    #[test]
    fn transport_error_flushes_all_pending_in_order_then_fires_disconnect_and_cleanup() {
        let (mut client, hooks, peer) = test_client();
        let invocations = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let inv = invocations.clone();
            let query = bson::to_vec(&bson::doc! { "i": i }).unwrap();
            client
                .query(
                    "db",
                    "col",
                    QueryFlags::empty(),
                    0,
                    0,
                    &query,
                    None,
                    Some(Box::new(move |reply: Option<&Reply>, _: &mut (dyn Any + Send)| {
                        inv.lock().unwrap().push((i, reply.is_some()));
                        Disposition::Continue
                    })),
                    Box::new(()),
                )
                .unwrap();
        }

        let disconnect_fired = Arc::new(Mutex::new(None));
        let flag = disconnect_fired.clone();
        client.set_disconnect_callback(Box::new(move |status| {
            *flag.lock().unwrap() = Some(status);
        }));

        drop(peer); // peer hang-up -> next read observes EOF/ECONNRESET-equivalent
        let _ = client.handle_read();

        let calls = invocations.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(*calls, vec![(0, false), (1, false), (2, false)]);
        assert!(client.pending.is_empty());
        assert_eq!(*disconnect_fired.lock().unwrap(), Some(DisconnectStatus::Err));
        assert_eq!(hooks.lock().unwrap().cleanup, 1);

        let query = bson::to_vec(&bson::doc! {}).unwrap();
        let err = client
            .query("db", "col", QueryFlags::empty(), 0, 0, &query, None, None, Box::new(()))
            .unwrap_err();
        assert!(matches!(err, MongoError::Other(_)));
    }

    #[test]
    fn free_flushes_pending_with_null_then_fires_disconnect_ok_and_cleanup() {
        let (mut client, hooks, _peer) = test_client();
        let invocations = Arc::new(Mutex::new(Vec::new()));

        for i in 0..2 {
            let inv = invocations.clone();
            let query = bson::to_vec(&bson::doc! { "i": i }).unwrap();
            client
                .query(
                    "db",
                    "col",
                    QueryFlags::empty(),
                    0,
                    0,
                    &query,
                    None,
                    Some(Box::new(move |reply: Option<&Reply>, _: &mut (dyn Any + Send)| {
                        inv.lock().unwrap().push((i, reply.is_some()));
                        Disposition::Continue
                    })),
                    Box::new(()),
                )
                .unwrap();
        }

        let disconnect_fired = Arc::new(Mutex::new(None));
        let flag = disconnect_fired.clone();
        client.set_disconnect_callback(Box::new(move |status| {
            *flag.lock().unwrap() = Some(status);
        }));

        client.free();

        let calls = invocations.lock().unwrap();
        assert_eq!(*calls, vec![(0, false), (1, false)]);
        assert!(client.pending.is_empty());
        assert_eq!(*disconnect_fired.lock().unwrap(), Some(DisconnectStatus::Ok));
        assert_eq!(hooks.lock().unwrap().cleanup, 1);
        assert!(client.is_closed());
    }

    #[test]
    fn disposition_free_from_a_callback_tears_down_and_fires_disconnect_ok() {
        use std::io::Write;

        let (mut client, hooks, mut peer) = test_client();
        let disconnect_fired = Arc::new(Mutex::new(None));
        let flag = disconnect_fired.clone();
        client.set_disconnect_callback(Box::new(move |status| {
            *flag.lock().unwrap() = Some(status);
        }));

        let query = bson::to_vec(&bson::doc! { "ping": 1 }).unwrap();
        client
            .query(
                "db",
                "col",
                QueryFlags::empty(),
                0,
                0,
                &query,
                None,
                Some(Box::new(|_: Option<&Reply>, _: &mut (dyn Any + Send)| Disposition::Free)),
                Box::new(()),
            )
            .unwrap();

        let doc = bson::to_vec(&bson::doc! { "n": 1 }).unwrap();
        let frame = sample_reply_frame(0, &[&doc]);
        peer.write_all(&frame).unwrap();
        client.connection.buffer_read().unwrap();
        client.process_callbacks().unwrap();

        assert!(client.pending.is_empty());
        assert_eq!(*disconnect_fired.lock().unwrap(), Some(DisconnectStatus::Ok));
        assert_eq!(hooks.lock().unwrap().cleanup, 1);
        assert!(client.is_closed());
    }
}
