//! The deck: host-side RPC dispatcher for the light machine link.
//!
//! The deck owns the request-id space and a table of requests in flight.
//! At most one request is pending per `(machine, function)` key; further
//! calls for the same key coalesce, keeping only the newest arguments, and
//! are sent when the slot frees. A per-request watchdog reports a timeout
//! through the handler and releases the slot so the next coalesced call can
//! proceed. The device is never sent a cancellation.
//!
//! Inbound traffic is delivered through the [`DeckHandler`] capability;
//! block-wise transfers (UI state, I2C device pages) are driven to
//! completion by the deck itself, one outstanding block at a time.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fluxpilot_derive::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::types::encoding::{Blob, Decode, Encode};
use crate::types::words::{ProgramWord, StackWord};
use crate::utils::log::Logger;
use crate::wire::framing::{encode_frame, FrameAccumulator};
use crate::wire::message::{RequestId, WireMessage};

/// Default per-request watchdog interval.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_millis(200);

/// Error code reported through `on_error` when a watchdog fires. Device
/// codes are small; this one is host-synthesized.
pub const TIMEOUT_ERROR_CODE: u16 = 0xFFFF;

/// Coalescing key space for shared calls, disjoint from machine indices.
const SHARED_CALL_MACHINE: u16 = u16::MAX;

/// A boxed, pinned, send-safe future, for async trait methods without the
/// `async-trait` crate overhead.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors surfaced by the frame transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("the link is closed")]
    Closed,
}

/// Outbound frame transport (USB bulk endpoint, or an in-process link).
pub trait FrameLink: Send + Sync {
    fn send_frame(&self, frame: Vec<u8>) -> BoxFuture<'static, Result<(), LinkError>>;
}

/// Delivery capability for inbound traffic.
pub trait DeckHandler: Send + Sync + 'static {
    fn on_return(&self, request_id: RequestId, values: &[StackWord]);
    fn on_notification(&self, machine_index: u16, function_index: u16, values: &[StackWord]);
    fn on_error(&self, has_request_id: bool, request_id: RequestId, error_code: u16, message: &str);
    fn on_ui_state_block(
        &self,
        request_id: RequestId,
        total_size: u32,
        block_number: u16,
        block: &[u8],
    );
    fn on_i2c_devices(&self, request_id: RequestId, total_count: u16, devices: &[u16]);
}

/// One coalescing slot: a request in flight, plus at most the newest queued
/// replacement call.
struct Slot {
    queued: Option<Vec<StackWord>>,
}

type CallKey = (u16, u16);

/// State of an in-progress UI state blob transfer.
struct UiTransfer {
    next_block: u16,
    received: usize,
}

/// State of an in-progress I2C device scan.
struct I2cScan {
    received: usize,
}

/// Host-side dispatcher.
pub struct Deck<H: DeckHandler> {
    link: Arc<dyn FrameLink>,
    handler: Arc<H>,
    slots: DashMap<CallKey, Slot>,
    pending: DashMap<RequestId, CallKey>,
    next_request: AtomicU16,
    watchdog: Duration,
    accumulator: Mutex<FrameAccumulator>,
    ui_transfer: Mutex<Option<UiTransfer>>,
    i2c_scan: Mutex<Option<I2cScan>>,
    log: Logger,
}

impl<H: DeckHandler> Deck<H> {
    pub fn new(link: Arc<dyn FrameLink>, handler: Arc<H>) -> Arc<Self> {
        Self::with_watchdog(link, handler, DEFAULT_WATCHDOG)
    }

    pub fn with_watchdog(
        link: Arc<dyn FrameLink>,
        handler: Arc<H>,
        watchdog: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            link,
            handler,
            slots: DashMap::new(),
            pending: DashMap::new(),
            next_request: AtomicU16::new(1),
            watchdog,
            accumulator: Mutex::new(FrameAccumulator::new()),
            ui_transfer: Mutex::new(None),
            i2c_scan: Mutex::new(None),
            log: Logger::new("deck"),
        })
    }

    /// Calls a machine function. Returns the request id when the call was
    /// sent, or `None` when it was coalesced behind the one in flight.
    pub async fn call(
        self: &Arc<Self>,
        machine_index: ProgramWord,
        function_index: u16,
        args: Vec<StackWord>,
    ) -> Option<RequestId> {
        self.call_slot((machine_index, function_index), args).await
    }

    /// Calls a shared function; coalesced like machine calls, in a key
    /// space of its own.
    pub async fn call_shared(
        self: &Arc<Self>,
        function_index: u16,
        args: Vec<StackWord>,
    ) -> Option<RequestId> {
        self.call_slot((SHARED_CALL_MACHINE, function_index), args)
            .await
    }

    async fn call_slot(
        self: &Arc<Self>,
        key: CallKey,
        args: Vec<StackWord>,
    ) -> Option<RequestId> {
        {
            if let Some(mut slot) = self.slots.get_mut(&key) {
                // Coalesce: only the most recent parameters are retained.
                slot.queued = Some(args);
                return None;
            }
        }
        Some(self.send_call(key, args).await)
    }

    async fn send_call(self: &Arc<Self>, key: CallKey, args: Vec<StackWord>) -> RequestId {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.slots.insert(key, Slot { queued: None });
        self.pending.insert(request_id, key);

        let (machine_index, function_index) = key;
        let message = if machine_index == SHARED_CALL_MACHINE {
            WireMessage::CallSharedRequest {
                request_id,
                function_index,
                args,
            }
        } else {
            WireMessage::CallRequest {
                request_id,
                machine_index,
                function_index,
                args,
            }
        };
        self.send(&message).await;
        self.spawn_watchdog(request_id);
        request_id
    }

    fn spawn_watchdog(self: &Arc<Self>, request_id: RequestId) {
        let deck = self.clone();
        tokio::spawn(async move {
            sleep(deck.watchdog).await;
            if let Some((_, key)) = deck.pending.remove(&request_id) {
                deck.log
                    .warn(&format!("request {request_id} timed out, releasing slot"));
                deck.handler
                    .on_error(true, request_id, TIMEOUT_ERROR_CODE, "request timed out");
                deck.release_slot(key).await;
            }
        });
    }

    /// Sends a program image and UI state blob to the device.
    pub async fn load_program(self: &Arc<Self>, program: Vec<ProgramWord>, ui_state: Vec<u8>) {
        self.send(&WireMessage::LoadProgram {
            program,
            ui_state: Blob(ui_state),
        })
        .await;
    }

    /// Starts a UI state blob transfer from block zero.
    ///
    /// Replies stream to `on_ui_state_block`; the deck requests successive
    /// blocks until the accumulated length reaches the advertised total.
    pub async fn read_ui_state(self: &Arc<Self>) -> RequestId {
        {
            let mut transfer = self.ui_transfer.lock().await;
            *transfer = Some(UiTransfer {
                next_block: 0,
                received: 0,
            });
        }
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.send(&WireMessage::ReadUiStateBlock {
            request_id,
            block_number: 0,
        })
        .await;
        request_id
    }

    /// Starts an I2C device scan from offset zero.
    pub async fn read_i2c_devices(self: &Arc<Self>) -> RequestId {
        {
            let mut scan = self.i2c_scan.lock().await;
            *scan = Some(I2cScan { received: 0 });
        }
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.send(&WireMessage::ReadI2cDevices {
            request_id,
            offset: 0,
        })
        .await;
        request_id
    }

    /// Feeds raw link bytes through framing and dispatches each message.
    pub async fn receive_bytes(self: &Arc<Self>, bytes: &[u8]) {
        let frames = {
            let mut accumulator = self.accumulator.lock().await;
            accumulator.extend(bytes)
        };
        for frame in frames {
            match frame {
                Ok(payload) => self.receive_frame(&payload).await,
                Err(error) => self.log.warn(&format!("dropped frame: {error}")),
            }
        }
    }

    /// Dispatches one decoded frame payload.
    pub async fn receive_frame(self: &Arc<Self>, payload: &[u8]) {
        let message = match WireMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(error) => {
                self.log.warn(&format!("undecodable frame: {error}"));
                return;
            }
        };

        match message {
            WireMessage::CallReturn { request_id, values } => {
                if let Some((_, key)) = self.pending.remove(&request_id) {
                    self.handler.on_return(request_id, &values);
                    self.release_slot(key).await;
                } else {
                    self.log
                        .warn(&format!("return for unknown request {request_id}"));
                }
            }
            WireMessage::Notification {
                machine_index,
                function_index,
                values,
            } => {
                self.handler
                    .on_notification(machine_index, function_index, &values);
            }
            WireMessage::Error {
                has_request_id,
                request_id,
                error_code,
                message,
            } => {
                let message = String::from_utf8_lossy(&message).into_owned();
                if has_request_id != 0 {
                    if let Some((_, key)) = self.pending.remove(&request_id) {
                        self.release_slot(key).await;
                    }
                }
                self.handler
                    .on_error(has_request_id != 0, request_id, error_code, &message);
            }
            WireMessage::UiStateBlockReply {
                request_id,
                total_size,
                block_number,
                block,
            } => {
                self.ui_state_block(request_id, total_size, block_number, &block)
                    .await;
            }
            WireMessage::I2cDevicesReply {
                request_id,
                total_count,
                devices,
            } => {
                self.i2c_devices_page(request_id, total_count, &devices)
                    .await;
            }
            WireMessage::CallRequest { .. }
            | WireMessage::CallSharedRequest { .. }
            | WireMessage::LoadProgram { .. }
            | WireMessage::ReadUiStateBlock { .. }
            | WireMessage::ReadI2cDevices { .. } => {
                self.log.warn("host-only message received from the device");
            }
        }
    }

    async fn ui_state_block(
        self: &Arc<Self>,
        request_id: RequestId,
        total_size: u32,
        block_number: u16,
        block: &[u8],
    ) {
        let mut transfer = self.ui_transfer.lock().await;
        let Some(state) = transfer.as_mut() else {
            self.log.warn("ui state block without an active transfer");
            return;
        };

        // Out-of-order blocks abort the transfer; no restore is attempted.
        if block_number != state.next_block {
            self.log.warn(&format!(
                "ui state transfer aborted: expected block {}, got {}",
                state.next_block, block_number
            ));
            *transfer = None;
            return;
        }

        self.handler
            .on_ui_state_block(request_id, total_size, block_number, block);

        state.received += block.len();
        state.next_block += 1;
        if total_size == 0 || state.received >= total_size as usize {
            *transfer = None;
            return;
        }

        let block_number = state.next_block;
        drop(transfer);
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.send(&WireMessage::ReadUiStateBlock {
            request_id,
            block_number,
        })
        .await;
    }

    async fn i2c_devices_page(
        self: &Arc<Self>,
        request_id: RequestId,
        total_count: u16,
        devices: &[u16],
    ) {
        let mut scan = self.i2c_scan.lock().await;
        let Some(state) = scan.as_mut() else {
            self.log.warn("i2c device page without an active scan");
            return;
        };

        self.handler
            .on_i2c_devices(request_id, total_count, devices);

        state.received += devices.len();
        if state.received >= total_count as usize || devices.is_empty() {
            *scan = None;
            return;
        }

        let offset = state.received as u16;
        drop(scan);
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.send(&WireMessage::ReadI2cDevices { request_id, offset })
            .await;
    }

    /// Frees the slot a finished request held and sends its coalesced
    /// successor, if one accumulated.
    async fn release_slot(self: &Arc<Self>, key: CallKey) {
        let queued = self.slots.remove(&key).and_then(|(_, slot)| slot.queued);
        if let Some(args) = queued {
            self.send_call(key, args).await;
        }
    }

    async fn send(self: &Arc<Self>, message: &WireMessage) {
        let frame = encode_frame(&message.to_bytes());
        if self.link.send_frame(frame).await.is_err() {
            self.log.error("link send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::assembler::assemble_source;
    use crate::pilot::storage::MemStorage;
    use crate::pilot::Pilot;
    use crate::wire::framing::decode_frame;
    use std::sync::Mutex as StdMutex;

    /// Captures outbound frames for inspection.
    #[derive(Default)]
    struct TestLink {
        frames: StdMutex<Vec<Vec<u8>>>,
    }

    impl TestLink {
        fn take_raw(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.frames.lock().unwrap())
        }

        fn take_messages(&self) -> Vec<WireMessage> {
            self.take_raw()
                .into_iter()
                .map(|frame| {
                    let payload = decode_frame(&frame[..frame.len() - 1]).unwrap();
                    WireMessage::from_bytes(&payload).unwrap()
                })
                .collect()
        }
    }

    impl FrameLink for TestLink {
        fn send_frame(&self, frame: Vec<u8>) -> BoxFuture<'static, Result<(), LinkError>> {
            self.frames.lock().unwrap().push(frame);
            Box::pin(async { Ok(()) })
        }
    }

    /// Records every delivery for assertion.
    #[derive(Default)]
    struct TestHandler {
        returns: StdMutex<Vec<(RequestId, Vec<StackWord>)>>,
        notifications: StdMutex<Vec<(u16, u16, Vec<StackWord>)>>,
        errors: StdMutex<Vec<(bool, RequestId, u16, String)>>,
        ui_blocks: StdMutex<Vec<(u16, Vec<u8>)>>,
        i2c_pages: StdMutex<Vec<(u16, Vec<u16>)>>,
    }

    impl DeckHandler for TestHandler {
        fn on_return(&self, request_id: RequestId, values: &[StackWord]) {
            self.returns
                .lock()
                .unwrap()
                .push((request_id, values.to_vec()));
        }

        fn on_notification(&self, machine_index: u16, function_index: u16, values: &[StackWord]) {
            self.notifications
                .lock()
                .unwrap()
                .push((machine_index, function_index, values.to_vec()));
        }

        fn on_error(
            &self,
            has_request_id: bool,
            request_id: RequestId,
            error_code: u16,
            message: &str,
        ) {
            self.errors.lock().unwrap().push((
                has_request_id,
                request_id,
                error_code,
                message.to_string(),
            ));
        }

        fn on_ui_state_block(
            &self,
            _request_id: RequestId,
            _total_size: u32,
            block_number: u16,
            block: &[u8],
        ) {
            self.ui_blocks
                .lock()
                .unwrap()
                .push((block_number, block.to_vec()));
        }

        fn on_i2c_devices(&self, _request_id: RequestId, total_count: u16, devices: &[u16]) {
            self.i2c_pages
                .lock()
                .unwrap()
                .push((total_count, devices.to_vec()));
        }
    }

    fn deck_fixture() -> (Arc<Deck<TestHandler>>, Arc<TestLink>, Arc<TestHandler>) {
        let link = Arc::new(TestLink::default());
        let handler = Arc::new(TestHandler::default());
        let deck = Deck::new(link.clone() as Arc<dyn FrameLink>, handler.clone());
        (deck, link, handler)
    }

    #[tokio::test]
    async fn call_allocates_monotonic_request_ids() {
        let (deck, link, _) = deck_fixture();
        let first = deck.call(0, 1, vec![]).await.unwrap();
        let second = deck.call(0, 2, vec![]).await.unwrap();
        assert_eq!(second, first.wrapping_add(1));
        assert_eq!(link.take_messages().len(), 2);
    }

    #[tokio::test]
    async fn calls_for_one_key_coalesce_to_latest_args() {
        let (deck, link, handler) = deck_fixture();

        let id = deck.call(0, 3, vec![1]).await.unwrap();
        assert!(deck.call(0, 3, vec![2]).await.is_none());
        assert!(deck.call(0, 3, vec![3]).await.is_none());

        // Only the first call went out.
        let sent = link.take_messages();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            WireMessage::CallRequest { args, .. } if args == &vec![1]
        ));

        // The reply releases the slot and flushes the newest queued args.
        deck.receive_frame(
            &WireMessage::CallReturn {
                request_id: id,
                values: vec![9],
            }
            .to_bytes(),
        )
        .await;

        assert_eq!(handler.returns.lock().unwrap().clone(), vec![(id, vec![9])]);
        let sent = link.take_messages();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            WireMessage::CallRequest { args, .. } if args == &vec![3]
        ));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let (deck, link, _) = deck_fixture();
        assert!(deck.call(0, 1, vec![]).await.is_some());
        assert!(deck.call(0, 2, vec![]).await.is_some());
        assert!(deck.call(1, 1, vec![]).await.is_some());
        assert!(deck.call_shared(1, vec![]).await.is_some());
        assert_eq!(link.take_messages().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_times_out_and_flushes_the_queue() {
        let (deck, link, handler) = deck_fixture();

        let id = deck.call(0, 3, vec![1]).await.unwrap();
        assert!(deck.call(0, 3, vec![2]).await.is_none());
        link.take_raw();

        sleep(Duration::from_millis(250)).await;

        let errors = handler.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, true);
        assert_eq!(errors[0].1, id);
        assert_eq!(errors[0].2, TIMEOUT_ERROR_CODE);

        // The queued call went out after the slot was released.
        let sent = link.take_messages();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            WireMessage::CallRequest { args, .. } if args == &vec![2]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_after_timeout_is_dropped() {
        let (deck, _, handler) = deck_fixture();
        let id = deck.call(0, 3, vec![]).await.unwrap();
        sleep(Duration::from_millis(250)).await;

        deck.receive_frame(
            &WireMessage::CallReturn {
                request_id: id,
                values: vec![1],
            }
            .to_bytes(),
        )
        .await;
        assert!(handler.returns.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_reply_releases_the_slot() {
        let (deck, link, handler) = deck_fixture();
        let id = deck.call(0, 3, vec![]).await.unwrap();
        link.take_raw();

        deck.receive_frame(
            &WireMessage::Error {
                has_request_id: 1,
                request_id: id,
                error_code: 6,
                message: b"division by zero".to_vec(),
            }
            .to_bytes(),
        )
        .await;

        let errors = handler.errors.lock().unwrap().clone();
        assert_eq!(errors, vec![(true, id, 6, "division by zero".to_string())]);

        // The slot is free again.
        assert!(deck.call(0, 3, vec![]).await.is_some());
    }

    #[tokio::test]
    async fn notifications_pass_straight_through() {
        let (deck, _, handler) = deck_fixture();
        deck.receive_frame(
            &WireMessage::Notification {
                machine_index: 2,
                function_index: 4,
                values: vec![7],
            }
            .to_bytes(),
        )
        .await;
        assert_eq!(
            handler.notifications.lock().unwrap().clone(),
            vec![(2, 4, vec![7])]
        );
    }

    // ==================== UI state transfer ====================

    async fn feed_ui_block(
        deck: &Arc<Deck<TestHandler>>,
        request_id: RequestId,
        total_size: u32,
        block_number: u16,
        block: Vec<u8>,
    ) {
        deck.receive_frame(
            &WireMessage::UiStateBlockReply {
                request_id,
                total_size,
                block_number,
                block,
            }
            .to_bytes(),
        )
        .await;
    }

    #[tokio::test]
    async fn ui_state_transfer_collects_sequential_blocks() {
        let (deck, link, handler) = deck_fixture();
        let blob: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();

        deck.read_ui_state().await;
        let mut requests = link.take_messages();

        let mut served = 0usize;
        while let Some(WireMessage::ReadUiStateBlock {
            request_id,
            block_number,
        }) = requests.pop()
        {
            let start = block_number as usize * 128;
            let end = (start + 128).min(blob.len());
            feed_ui_block(&deck, request_id, 600, block_number, blob[start..end].to_vec()).await;
            served += end - start;
            requests = link.take_messages();
        }

        assert_eq!(served, 600);
        let blocks = handler.ui_blocks.lock().unwrap().clone();
        let numbers: Vec<u16> = blocks.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3, 4]);
        let collected: Vec<u8> = blocks.into_iter().flat_map(|(_, data)| data).collect();
        assert_eq!(collected, blob);
    }

    #[tokio::test]
    async fn out_of_order_block_aborts_the_transfer() {
        let (deck, link, handler) = deck_fixture();
        deck.read_ui_state().await;
        link.take_raw();

        feed_ui_block(&deck, 1, 600, 0, vec![0; 128]).await;
        assert_eq!(link.take_raw().len(), 1); // block 1 requested

        // Block 2 arrives instead of block 1.
        feed_ui_block(&deck, 2, 600, 2, vec![0; 128]).await;
        assert!(link.take_raw().is_empty(), "aborted transfer must not continue");
        assert_eq!(handler.ui_blocks.lock().unwrap().len(), 1);

        // A fresh transfer starts from block zero again.
        deck.read_ui_state().await;
        assert_eq!(link.take_messages().len(), 1);
    }

    #[tokio::test]
    async fn zero_total_ends_the_transfer_immediately() {
        let (deck, link, handler) = deck_fixture();
        deck.read_ui_state().await;
        link.take_raw();

        feed_ui_block(&deck, 1, 0, 0, vec![]).await;
        assert!(link.take_raw().is_empty());
        assert_eq!(handler.ui_blocks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stray_ui_block_without_transfer_is_ignored() {
        let (deck, link, handler) = deck_fixture();
        feed_ui_block(&deck, 1, 600, 0, vec![0; 128]).await;
        assert!(link.take_raw().is_empty());
        assert!(handler.ui_blocks.lock().unwrap().is_empty());
    }

    // ==================== I2C device scan ====================

    #[tokio::test]
    async fn i2c_scan_pages_until_total() {
        let (deck, link, handler) = deck_fixture();
        deck.read_i2c_devices().await;

        let sent = link.take_messages();
        assert!(matches!(
            sent[0],
            WireMessage::ReadI2cDevices { offset: 0, .. }
        ));

        deck.receive_frame(
            &WireMessage::I2cDevicesReply {
                request_id: 1,
                total_count: 20,
                devices: (0..16).collect(),
            }
            .to_bytes(),
        )
        .await;

        let sent = link.take_messages();
        assert!(matches!(
            sent[0],
            WireMessage::ReadI2cDevices { offset: 16, .. }
        ));

        deck.receive_frame(
            &WireMessage::I2cDevicesReply {
                request_id: 2,
                total_count: 20,
                devices: (16..20).collect(),
            }
            .to_bytes(),
        )
        .await;
        assert!(link.take_raw().is_empty());

        let pages = handler.i2c_pages.lock().unwrap().clone();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].1.len(), 16);
        assert_eq!(pages[1].1.len(), 4);
    }

    // ==================== Deck to pilot, end to end ====================

    const ADDER: &str = r#"
        .machine adder locals 0 functions 4
        .func init index 0
            EXIT
        .end
        .func start_frame index 1
            POP
            EXIT
        .end
        .func get_color index 2
            POP
            PUSH 0
            PUSH 0
            PUSH 0
            EXIT
        .end
        .func add index 3
            ADD
            EXIT
        .end
        .end
    "#;

    /// Routes frames captured on the link through a pilot and feeds the
    /// replies back to the deck until the link goes quiet.
    async fn pump(
        deck: &Arc<Deck<TestHandler>>,
        link: &Arc<TestLink>,
        pilot: &mut Pilot<MemStorage>,
    ) {
        loop {
            let frames = link.take_raw();
            if frames.is_empty() {
                return;
            }
            for frame in frames {
                let payload = decode_frame(&frame[..frame.len() - 1]).unwrap();
                for reply in pilot.process_frame(&payload) {
                    deck.receive_bytes(&encode_frame(&reply.to_bytes())).await;
                }
            }
        }
    }

    #[tokio::test]
    async fn deck_drives_a_pilot_end_to_end() {
        let (deck, link, handler) = deck_fixture();
        let mut pilot = Pilot::new(MemStorage::new(), 256);

        let image = assemble_source(ADDER).unwrap();
        let blob: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        deck.load_program(image, blob.clone()).await;
        pump(&deck, &link, &mut pilot).await;

        // A machine call round-trips.
        let id = deck.call(0, 3, vec![20, 22]).await.unwrap();
        pump(&deck, &link, &mut pilot).await;
        assert_eq!(
            handler.returns.lock().unwrap().clone(),
            vec![(id, vec![42])]
        );

        // The persisted UI state comes back block by block.
        deck.read_ui_state().await;
        pump(&deck, &link, &mut pilot).await;
        let blocks = handler.ui_blocks.lock().unwrap().clone();
        let collected: Vec<u8> = blocks.into_iter().flat_map(|(_, data)| data).collect();
        assert_eq!(collected, blob);

        // A faulting call surfaces an error frame with its request id.
        let id = deck.call(9, 0, vec![]).await.unwrap();
        pump(&deck, &link, &mut pilot).await;
        let errors = handler.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, true);
        assert_eq!(errors[0].1, id);
    }
}
