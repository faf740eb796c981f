use crate::binding::BindingTable;
use crate::config::HostConfig;
use crate::diagnostics::{DiagnosticLog, Severity};
use crate::error::{NativeOpError, TransportError};
use crate::handle::{HandleTable, NativeElement};
use crate::patch::{PatchReport, apply_patches, attach_transfer_elems};
use crate::protocol::{
    BackendEnvelope, BackendUpdate, EventDetail, FrontendEnvelope, FrontendUpdate, REF_OP_FOCUS,
    VDomEvent, VDomRefOperation, VDomRenderContext, now_ms,
};
use crate::revision::RevisionCounters;
use crate::scheduler::{AlarmAction, PendingRequestState, PendingSnapshot, RoundDecision, UpdateScheduler};
use crate::timer::Alarm;
use crate::tree::{ElementTree, NodeIndex, TreeNode, VDomElem, build_index};
use crate::value::{FuncRef, PropValue};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use tracing::{debug, info};

/// The request/response channel to the remote process. `send` hands a request
/// off; its response comes back through [`TreeSession::complete_round`].
pub trait Transport {
    fn send(&mut self, envelope: FrontendEnvelope) -> Result<(), TransportError>;
}

/// A prop value with references replaced by what the renderer can use.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    Literal(Value),
    Handler(FuncRef),
    Handle { id: String, mounted: bool },
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub fired: bool,
    pub prevent_default: bool,
    pub stop_propagation: bool,
}

/// Everything one panel knows about the remote-described tree. Created when the
/// panel opens and dropped (after [`TreeSession::dispose`]) when it closes.
pub struct TreeSession {
    config: HostConfig,
    tree: ElementTree,
    index: NodeIndex,
    revisions: RevisionCounters,
    bindings: BindingTable,
    handles: HandleTable,
    pending: PendingRequestState,
    in_flight_snapshot: Option<PendingSnapshot>,
    partial_response: Option<BackendUpdate>,
    scheduler: UpdateScheduler,
    transport: Box<dyn Transport>,
    diagnostics: DiagnosticLog,
    render_context: VDomRenderContext,
    root_element: Option<Box<dyn NativeElement>>,
}

impl TreeSession {
    pub fn new(config: HostConfig, alarm: Box<dyn Alarm>, transport: Box<dyn Transport>) -> Self {
        let scheduler = UpdateScheduler::new(alarm, config.sync_interval(), config.round_timeout());
        let render_context = VDomRenderContext {
            root_ref_id: config.root_ref_id(),
            ..VDomRenderContext::default()
        };
        let diagnostics = DiagnosticLog::new(config.diagnostic_log_cap);

        Self {
            config,
            tree: ElementTree::new(),
            index: NodeIndex::default(),
            revisions: RevisionCounters::default(),
            bindings: BindingTable::default(),
            handles: HandleTable::default(),
            pending: PendingRequestState::default(),
            in_flight_snapshot: None,
            partial_response: None,
            scheduler,
            transport,
            diagnostics,
            render_context,
            root_element: None,
        }
    }

    // ---- rendering layer: reads ----

    pub fn subscribe_to_revision(&self, node_id: &str) -> u64 {
        self.revisions.get(node_id)
    }

    pub fn revision_epoch(&self) -> u64 {
        self.revisions.epoch()
    }

    pub fn node(&self, node_id: &str) -> Option<&TreeNode> {
        self.index.get(node_id).and_then(|key| self.tree.node(key))
    }

    pub fn snapshot(&self) -> Option<VDomElem> {
        self.tree.snapshot()
    }

    pub fn tree(&self) -> &ElementTree {
        &self.tree
    }

    pub fn index(&self) -> &NodeIndex {
        &self.index
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    pub fn render_context(&self) -> &VDomRenderContext {
        &self.render_context
    }

    pub fn pending(&self) -> &PendingRequestState {
        &self.pending
    }

    pub fn scheduler(&self) -> &UpdateScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn resolve_prop(&self, node_id: &str, key: &str) -> ResolvedValue {
        match self.node(node_id).and_then(|node| node.prop(key)) {
            Some(value) => self.resolve_value(value),
            None => ResolvedValue::Missing,
        }
    }

    fn resolve_value(&self, value: &PropValue) -> ResolvedValue {
        match value {
            PropValue::Literal(value) => ResolvedValue::Literal(value.clone()),
            PropValue::Binding(binding) => ResolvedValue::Literal(self.bindings.value(&binding.name)),
            PropValue::Func(func) => ResolvedValue::Handler(func.clone()),
            PropValue::Handle(handle) => ResolvedValue::Handle {
                id: handle.id.clone(),
                mounted: self
                    .handles
                    .get(&handle.id)
                    .is_some_and(|container| container.is_mounted()),
            },
        }
    }

    // ---- rendering layer: writes ----

    /// Resolves every prop of `node_id` and records which bindings it now
    /// depends on, so later binding changes bump its revision.
    pub fn render_props(&mut self, node_id: &str) -> BTreeMap<String, ResolvedValue> {
        let Some(props) = self.node(node_id).and_then(|node| node.props.clone()) else {
            self.bindings.release_node(node_id);
            return BTreeMap::new();
        };

        let mut deps = BTreeSet::new();
        for (key, value) in &props {
            match value {
                PropValue::Binding(binding) if binding.name.is_empty() => {
                    self.diagnostics.local(
                        Severity::Warn,
                        format!("node '{node_id}' prop '{key}' references a binding with no name"),
                    );
                }
                PropValue::Binding(binding) => {
                    deps.insert(binding.name.clone());
                }
                PropValue::Handle(handle) if !handle.id.is_empty() => {
                    self.handles.get_or_create(handle);
                }
                _ => {}
            }
        }
        self.bindings.sync_node_dependencies(node_id, deps);

        props
            .iter()
            .map(|(key, value)| (key.clone(), self.resolve_value(value)))
            .collect()
    }

    pub fn unmount_node(&mut self, node_id: &str) {
        self.bindings.release_node(node_id);
    }

    /// Queues a user interaction and asks for a low-latency round. Dropped
    /// once the session is disposed.
    pub fn report_event(&mut self, event: VDomEvent) {
        if self.is_disposed() {
            debug!(node_id = %event.node_id, "ignoring event on a disposed session");
            return;
        }
        self.pending.events.push(event);
        self.request_sync(true);
    }

    /// Runs the handler bound to `prop_key` if its event types and key filter
    /// accept this native `event_type`. The event goes out under the prop name.
    /// The outcome tells the native layer what to suppress.
    pub fn fire_handler(
        &mut self,
        node_id: &str,
        prop_key: &str,
        event_type: &str,
        detail: EventDetail,
    ) -> HandlerOutcome {
        if self.is_disposed() {
            return HandlerOutcome::default();
        }
        let ResolvedValue::Handler(func) = self.resolve_prop(node_id, prop_key) else {
            return HandlerOutcome::default();
        };
        if !func.fires_on(prop_key, event_type) || !func.accepts_key(detail.key()) {
            return HandlerOutcome::default();
        }

        let mut event = VDomEvent::new(node_id, prop_key, detail);
        event.global_event_type = func.global_event.clone();
        self.report_event(event);
        HandlerOutcome {
            fired: true,
            prevent_default: func.prevent_default,
            stop_propagation: func.stop_propagation,
        }
    }

    pub fn report_handle_attach(&mut self, handle_id: &str, element: Option<Box<dyn NativeElement>>) {
        if self.is_disposed() {
            return;
        }
        if let Some(update) = self.handles.attach(handle_id, element) {
            debug!(handle_id, mounted = update.has_current, "handle mount state changed");
            self.pending.ref_updates.push(update);
        }
    }

    pub fn attach_root_element(&mut self, element: Option<Box<dyn NativeElement>>) {
        self.root_element = element;
    }

    /// Optimistic local write; sent to the remote unless it already matches
    /// the confirmed value.
    pub fn set_binding_value(&mut self, name: &str, value: Value) {
        if name.is_empty() {
            self.diagnostics
                .local(Severity::Warn, "ignored local write to a binding with no name");
            return;
        }
        self.bindings.set_value(name, value, false, &mut self.revisions);
    }

    pub fn set_panel_size(&mut self, width: u32, height: u32) {
        if self.render_context.width != width || self.render_context.height != height {
            self.render_context.width = width;
            self.render_context.height = height;
            self.pending.render_context_dirty = true;
        }
    }

    pub fn set_focused(&mut self, focused: bool) {
        if self.render_context.focused != focused {
            self.render_context.focused = focused;
            self.pending.render_context_dirty = true;
        }
    }

    pub fn set_background(&mut self, background: bool) {
        if self.render_context.background != background {
            self.render_context.background = background;
            self.pending.render_context_dirty = true;
        }
    }

    // ---- transport side ----

    pub fn start(&mut self) {
        info!(client_id = %self.config.client_id, "starting tree session");
        self.request_sync(true);
    }

    pub fn request_sync(&mut self, force: bool) {
        let has_news = self.pending.has_news() || self.bindings.has_unconfirmed_writes();
        if let RoundDecision::Send(request_id) = self.scheduler.begin_round(force, has_news) {
            self.send_round(request_id);
        }
    }

    fn send_round(&mut self, request_id: u64) {
        let mut snapshot = self.pending.take();
        snapshot.state_sync = self.bindings.take_outgoing();
        snapshot.ref_updates.extend(self.handles.take_position_updates());

        let update = FrontendUpdate {
            ts: now_ms(),
            client_id: self.config.client_id.clone(),
            request_id,
            resync: snapshot.resync,
            dispose: false,
            render_context: self.render_context.clone(),
            events: snapshot.events.clone(),
            state_sync: snapshot.state_sync.clone(),
            ref_updates: snapshot.ref_updates.clone(),
            messages: self.diagnostics.take_unforwarded(),
        };
        debug!(
            request_id,
            events = update.events.len(),
            ref_updates = update.ref_updates.len(),
            resync = update.resync,
            "sending frontend update"
        );
        self.in_flight_snapshot = Some(snapshot);

        if let Err(err) = self.transport.send(FrontendEnvelope::Update(update)) {
            self.complete_round(request_id, Err(err));
        }
    }

    /// Ends round `request_id`. Responses for any other round, or arriving after
    /// dispose, are dropped. A failed round requeues what it carried.
    pub fn complete_round(&mut self, request_id: u64, result: Result<BackendUpdate, TransportError>) {
        if !self.scheduler.finish_round(request_id) {
            debug!(request_id, "ignoring response for a round that is not outstanding");
            return;
        }
        let snapshot = self.in_flight_snapshot.take();
        self.partial_response = None;

        match result {
            Ok(update) => {
                let has_work = update.has_work;
                self.apply_backend_update(update);
                if has_work {
                    self.scheduler.expedite();
                }
            }
            Err(err) => {
                self.diagnostics.local(
                    Severity::Error,
                    format!("sync round {request_id} failed: {err}"),
                );
                if let Some(snapshot) = snapshot {
                    self.bindings.restore_outgoing(snapshot.state_sync.clone());
                    self.pending.restore(snapshot);
                }
                // A timed-out response may still have been applied remotely.
                if matches!(err, TransportError::Timeout(_)) {
                    self.pending.resync_needed = true;
                }
            }
        }
    }

    /// Routes one message from the remote. Chunks of a split response are
    /// held until the last one arrives, then applied together.
    pub fn deliver(&mut self, envelope: BackendEnvelope) {
        match envelope {
            BackendEnvelope::Update(update) => {
                let response_id = update.response_id;
                if self.scheduler.in_flight() != Some(response_id) {
                    debug!(response_id, "ignoring response for a round that is not outstanding");
                    return;
                }
                let update = match self.partial_response.take() {
                    Some(mut partial) => {
                        partial.absorb(update);
                        partial
                    }
                    None => update,
                };
                if update.more {
                    debug!(response_id, "holding partial response");
                    self.partial_response = Some(update);
                    return;
                }
                self.complete_round(response_id, Ok(update));
            }
            BackendEnvelope::AsyncInitiation { .. } => self.notify_remote_work(),
        }
    }

    /// The remote has something to push; run a round as soon as allowed.
    pub fn notify_remote_work(&mut self) {
        self.request_sync(true);
    }

    pub fn on_alarm(&mut self) {
        match self.scheduler.on_alarm() {
            AlarmAction::Tick => self.request_sync(false),
            AlarmAction::TimedOut(request_id) => {
                self.complete_round(request_id, Err(TransportError::Timeout(request_id)))
            }
            AlarmAction::Ignore => {}
        }
    }

    pub fn apply_backend_update(&mut self, update: BackendUpdate) -> PatchReport {
        let BackendUpdate {
            mut render_updates,
            transfer_elems,
            state_sync,
            ref_operations,
            messages,
            ..
        } = update;

        let mut report = PatchReport::default();
        if !render_updates.is_empty() {
            attach_transfer_elems(&mut render_updates, transfer_elems);
            report = apply_patches(
                &mut self.tree,
                render_updates,
                &mut self.revisions,
                &mut self.diagnostics,
            );
            self.refresh_index();
        }

        for entry in state_sync {
            if entry.name.is_empty() {
                self.diagnostics
                    .local(Severity::Warn, "state sync entry names no binding");
                continue;
            }
            self.bindings
                .set_value(&entry.name, entry.value, true, &mut self.revisions);
        }

        for operation in &ref_operations {
            self.run_handle_operation(operation);
        }

        for message in &messages {
            self.diagnostics.remote(message);
        }

        report
    }

    fn run_handle_operation(&mut self, operation: &VDomRefOperation) {
        if operation.op != REF_OP_FOCUS {
            self.diagnostics.local(
                Severity::Warn,
                format!("unknown handle operation '{}' on '{}'", operation.op, operation.ref_id),
            );
            return;
        }

        let result = if operation.ref_id == self.render_context.root_ref_id {
            self.root_element
                .as_ref()
                .map_or(Err(NativeOpError::NotMounted), |root| root.focus())
        } else {
            match self.handles.get(&operation.ref_id) {
                Some(container) => container.focus(),
                None => {
                    self.diagnostics.local(
                        Severity::Warn,
                        format!("handle operation targets unknown handle '{}'", operation.ref_id),
                    );
                    return;
                }
            }
        };

        if let Err(err) = result {
            self.diagnostics.local(
                Severity::Warn,
                format!("focus on handle '{}' failed: {err}", operation.ref_id),
            );
        }
    }

    /// Rebuilds the index from the live tree and drops binding dependencies of
    /// nodes that left it.
    fn refresh_index(&mut self) {
        self.index = build_index(&self.tree);
        for duplicate in self.index.duplicates().to_vec() {
            self.diagnostics.local(
                Severity::Warn,
                format!("duplicate node id '{duplicate}' in tree; first occurrence wins"),
            );
        }

        let departed: Vec<String> = self
            .bindings
            .tracked_nodes()
            .filter(|node_id| !self.index.contains(node_id))
            .map(str::to_string)
            .collect();
        for node_id in departed {
            self.bindings.release_node(&node_id);
        }
    }

    /// Discards the local tree and asks the remote to resend everything.
    pub fn reset(&mut self) {
        info!("resetting tree; requesting resync");
        self.tree.clear();
        self.refresh_index();
        self.pending.resync_needed = true;
        self.request_sync(true);
    }

    /// Stops all scheduling and tells the remote the panel is gone. A response
    /// still in transit is ignored when it arrives.
    pub fn dispose(&mut self) {
        if self.scheduler.is_disposed() {
            return;
        }
        self.scheduler.dispose();
        self.in_flight_snapshot = None;
        self.partial_response = None;
        self.root_element = None;

        let update = FrontendUpdate {
            ts: now_ms(),
            client_id: self.config.client_id.clone(),
            dispose: true,
            render_context: self.render_context.clone(),
            ..FrontendUpdate::default()
        };
        if let Err(err) = self.transport.send(FrontendEnvelope::Update(update)) {
            debug!(%err, "dispose notification not delivered");
        }
        info!(client_id = %self.config.client_id, "tree session disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.scheduler.is_disposed()
    }

    /// Indented text rendering of the tree with resolved props. Registers
    /// binding dependencies like any other render pass.
    pub fn render_outline(&mut self) -> String {
        let mut rows: Vec<(usize, String, String, Option<String>)> = Vec::new();
        self.tree.walk(|depth, _, node| {
            rows.push((depth, node.id.clone(), node.tag.clone(), node.text.clone()));
        });

        let mut out = String::new();
        for (depth, id, tag, text) in rows {
            let indent = "  ".repeat(depth);
            if let Some(text) = text.as_deref().filter(|_| id.is_empty()) {
                let _ = writeln!(out, "{indent}{text:?}");
                continue;
            }

            let _ = write!(out, "{indent}<{tag}");
            if !id.is_empty() {
                let _ = write!(out, " #{id}");
                for (key, value) in self.render_props(&id) {
                    match value {
                        ResolvedValue::Literal(value) => {
                            let _ = write!(out, " {key}={value}");
                        }
                        ResolvedValue::Handler(_) => {
                            let _ = write!(out, " {key}=<handler>");
                        }
                        ResolvedValue::Handle { id, mounted } => {
                            let _ = write!(out, " {key}=<ref {id} mounted={mounted}>");
                        }
                        ResolvedValue::Missing => {}
                    }
                }
            }
            match text {
                Some(text) => {
                    let _ = writeln!(out, ">{text}");
                }
                None => {
                    let _ = writeln!(out, ">");
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{VDomMessage, VDomRenderUpdate, VDomStateSync};
    use crate::tree::VDomTransferElem;
    use crate::timer::ManualAlarm;
    use crate::value::{BindingRef, HandleRef};
    use serde_json::json;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Rc<RefCell<Vec<FrontendUpdate>>>,
        fail_next: Rc<Cell<bool>>,
    }

    impl Transport for RecordingTransport {
        fn send(&mut self, envelope: FrontendEnvelope) -> Result<(), TransportError> {
            if self.fail_next.replace(false) {
                return Err(TransportError::Closed);
            }
            let FrontendEnvelope::Update(update) = envelope;
            self.sent.borrow_mut().push(update);
            Ok(())
        }
    }

    struct FocusCounter(Rc<Cell<u32>>);

    impl NativeElement for FocusCounter {
        fn focus(&self) -> Result<(), NativeOpError> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    struct Harness {
        session: TreeSession,
        alarm: ManualAlarm,
        transport: RecordingTransport,
    }

    impl Harness {
        fn new() -> Self {
            let alarm = ManualAlarm::new();
            let transport = RecordingTransport::default();
            let config = HostConfig {
                sync_interval_ms: 100,
                round_timeout_ms: 0,
                ..HostConfig::default()
            };
            let session = TreeSession::new(config, Box::new(alarm.clone()), Box::new(transport.clone()));
            Self {
                session,
                alarm,
                transport,
            }
        }

        fn sent(&self) -> Vec<FrontendUpdate> {
            self.transport.sent.borrow().clone()
        }

        fn last_request_id(&self) -> u64 {
            self.transport
                .sent
                .borrow()
                .last()
                .map(|update| update.request_id)
                .expect("a request was sent")
        }

        /// Starts the session and answers the initial resync round.
        fn started_with(root: VDomElem) -> Self {
            let mut harness = Self::new();
            harness.session.start();
            let request_id = harness.last_request_id();
            harness.respond(
                request_id,
                BackendUpdate {
                    render_updates: vec![VDomRenderUpdate::root(root)],
                    ..BackendUpdate::default()
                },
            );
            harness
        }

        fn respond(&mut self, request_id: u64, update: BackendUpdate) {
            self.session.complete_round(
                request_id,
                Ok(BackendUpdate {
                    response_id: request_id,
                    ..update
                }),
            );
        }
    }

    fn click(node_id: &str) -> VDomEvent {
        VDomEvent::new(node_id, "onClick", EventDetail::default())
    }

    fn typed(node_id: &str, value: &str) -> VDomEvent {
        VDomEvent::new(
            node_id,
            "onChange",
            EventDetail {
                target_value: Some(value.to_string()),
                ..EventDetail::default()
            },
        )
    }

    fn binding(name: &str) -> PropValue {
        PropValue::Binding(BindingRef {
            name: name.to_string(),
        })
    }

    #[test]
    fn first_round_requests_resync_with_render_context() {
        let mut harness = Harness::new();
        harness.session.set_panel_size(300, 200);
        harness.session.start();

        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].resync);
        assert_eq!(sent[0].render_context.width, 300);
        assert_eq!(sent[0].render_context.root_ref_id, "C1:root");
        assert!(!harness.session.pending().resync_needed);
    }

    #[test]
    fn binding_scenario_bumps_consumer_once() {
        let mut harness =
            Harness::started_with(VDomElem::new("x", "span").with_prop("text", binding("count")));

        let props = harness.session.render_props("x");
        assert_eq!(props["text"], ResolvedValue::Literal(Value::Null));
        let before = harness.session.subscribe_to_revision("x");

        harness.session.apply_backend_update(BackendUpdate {
            state_sync: vec![VDomStateSync {
                name: "count".to_string(),
                value: json!(3),
            }],
            ..BackendUpdate::default()
        });

        assert_eq!(harness.session.subscribe_to_revision("x"), before + 1);
        assert_eq!(
            harness.session.resolve_prop("x", "text"),
            ResolvedValue::Literal(json!(3))
        );
    }

    #[test]
    fn events_recorded_during_round_go_out_in_order_next_round() {
        let mut harness = Harness::started_with(VDomElem::new("root", "div"));
        let first_id = harness.last_request_id();
        assert!(harness.alarm.fire());
        harness.session.on_alarm();
        assert_eq!(harness.sent().len(), 1, "idle tick sends nothing");

        harness.session.report_event(click("root"));
        let in_flight = harness.last_request_id();
        assert_ne!(in_flight, first_id);

        harness.session.report_event(typed("root", "a"));
        harness.session.report_event(typed("root", "b"));
        assert_eq!(harness.sent().len(), 2);

        harness.respond(in_flight, BackendUpdate::default());
        assert_eq!(harness.alarm.armed_delay(), Some(Duration::ZERO));
        assert!(harness.alarm.fire());
        harness.session.on_alarm();

        let sent = harness.sent();
        let values: Vec<_> = sent[2]
            .events
            .iter()
            .map(|event| event.detail.target_value.as_deref())
            .collect();
        assert_eq!(values, vec![Some("a"), Some("b")]);
    }

    #[test]
    fn transport_failure_requeues_events_ahead_of_new_ones() {
        let mut harness = Harness::started_with(VDomElem::new("root", "div"));
        harness.transport.fail_next.set(true);

        harness.session.report_event(typed("root", "1"));
        assert_eq!(harness.session.scheduler().in_flight(), None);
        assert_eq!(harness.session.diagnostics().len(), 1);

        harness.session.pending.events.push(typed("root", "2"));
        let order: Vec<_> = harness
            .session
            .pending()
            .events
            .iter()
            .map(|event| event.detail.target_value.as_deref())
            .collect();
        assert_eq!(order, vec![Some("1"), Some("2")]);
        assert_eq!(harness.alarm.armed_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn timed_out_round_is_failed_and_late_response_ignored() {
        let alarm = ManualAlarm::new();
        let transport = RecordingTransport::default();
        let config = HostConfig {
            round_timeout_ms: 500,
            ..HostConfig::default()
        };
        let mut session = TreeSession::new(config, Box::new(alarm.clone()), Box::new(transport.clone()));

        session.start();
        assert_eq!(alarm.armed_delay(), Some(Duration::from_millis(500)));
        assert!(alarm.fire());
        session.on_alarm();

        assert_eq!(session.scheduler().in_flight(), None);
        assert!(session.pending().resync_needed);

        session.complete_round(
            1,
            Ok(BackendUpdate {
                response_id: 1,
                render_updates: vec![VDomRenderUpdate::root(VDomElem::new("late", "div"))],
                ..BackendUpdate::default()
            }),
        );
        assert!(session.snapshot().is_none());
    }

    #[test]
    fn timed_out_event_round_asks_for_resync_next_time() {
        let alarm = ManualAlarm::new();
        let transport = RecordingTransport::default();
        let config = HostConfig {
            round_timeout_ms: 500,
            ..HostConfig::default()
        };
        let mut session =
            TreeSession::new(config, Box::new(alarm.clone()), Box::new(transport.clone()));
        session.start();
        session.complete_round(
            1,
            Ok(BackendUpdate {
                response_id: 1,
                render_updates: vec![VDomRenderUpdate::root(VDomElem::new("root", "div"))],
                ..BackendUpdate::default()
            }),
        );
        assert!(!session.pending().resync_needed);

        session.report_event(click("root"));
        let timed_out = session.scheduler().in_flight().expect("event round in flight");
        assert!(!transport.sent.borrow()[1].resync);
        assert!(alarm.fire());
        session.on_alarm();

        assert_eq!(session.scheduler().in_flight(), None);
        assert!(session.pending().resync_needed);
        assert_eq!(session.pending().events.len(), 1);

        assert!(alarm.fire());
        session.on_alarm();
        let sent = transport.sent.borrow();
        let retry = sent.last().expect("retry sent");
        assert_ne!(retry.request_id, timed_out);
        assert!(retry.resync);
        assert_eq!(retry.events.len(), 1);
    }

    #[test]
    fn split_response_is_applied_once_the_last_chunk_arrives() {
        let mut harness = Harness::new();
        harness.session.start();
        let request_id = harness.last_request_id();
        let elem = |id: &str, tag: &str, children: &[&str]| VDomTransferElem {
            id: id.to_string(),
            tag: tag.to_string(),
            props: None,
            children: children.iter().map(|child| child.to_string()).collect(),
            text: None,
        };

        harness.session.deliver(BackendEnvelope::Update(BackendUpdate {
            response_id: request_id,
            more: true,
            render_updates: vec![VDomRenderUpdate {
                vdom: None,
                vdom_id: "root".to_string(),
                ..VDomRenderUpdate::root(VDomElem::new("", "div"))
            }],
            transfer_elems: vec![elem("a", "span", &[])],
            ..BackendUpdate::default()
        }));
        assert!(harness.session.snapshot().is_none());
        assert_eq!(harness.session.scheduler().in_flight(), Some(request_id));

        harness.session.deliver(BackendEnvelope::Update(BackendUpdate {
            response_id: request_id,
            transfer_elems: vec![elem("root", "div", &["a", "b"]), elem("b", "p", &[])],
            state_sync: vec![VDomStateSync {
                name: "n".to_string(),
                value: json!(1),
            }],
            ..BackendUpdate::default()
        }));

        assert_eq!(harness.session.scheduler().in_flight(), None);
        assert_eq!(
            harness.session.snapshot(),
            Some(
                VDomElem::new("root", "div")
                    .with_child(VDomElem::new("a", "span"))
                    .with_child(VDomElem::new("b", "p"))
            )
        );
        assert_eq!(harness.session.bindings().value("n"), json!(1));
        assert!(harness.session.diagnostics().is_empty());
    }

    #[test]
    fn stray_chunk_for_another_round_is_dropped() {
        let mut harness = Harness::new();
        harness.session.start();
        let request_id = harness.last_request_id();

        harness.session.deliver(BackendEnvelope::Update(BackendUpdate {
            response_id: request_id + 7,
            more: true,
            render_updates: vec![VDomRenderUpdate::root(VDomElem::new("stray", "div"))],
            ..BackendUpdate::default()
        }));
        harness.session.deliver(BackendEnvelope::Update(BackendUpdate {
            response_id: request_id,
            render_updates: vec![VDomRenderUpdate::root(VDomElem::new("root", "div"))],
            ..BackendUpdate::default()
        }));

        assert_eq!(harness.session.snapshot(), Some(VDomElem::new("root", "div")));
    }

    #[test]
    fn index_tracks_tree_across_patch_batches() {
        let mut harness = Harness::started_with(
            VDomElem::new("root", "div")
                .with_child(VDomElem::new("a", "section").with_child(VDomElem::new("a1", "p")))
                .with_child(VDomElem::text("t")),
        );
        let batches = vec![
            vec![
                VDomRenderUpdate::append("a", VDomElem::new("a2", "p")),
                VDomRenderUpdate::insert("root", 0, VDomElem::new("b", "ul").with_child(VDomElem::new("b1", "li"))),
            ],
            vec![
                VDomRenderUpdate::replace("a", 0, VDomElem::new("a3", "em")),
                VDomRenderUpdate::append("b", VDomElem::new("b2", "li")),
                VDomRenderUpdate::append("missing", VDomElem::new("ghost", "i")),
            ],
            vec![VDomRenderUpdate::remove("root", 1)],
            vec![VDomRenderUpdate::root(
                VDomElem::new("root2", "div").with_child(VDomElem::new("c", "span")),
            )],
        ];
        let expected_ids: Vec<Vec<&str>> = vec![
            vec!["a", "a1", "a2", "b", "b1", "root"],
            vec!["a", "a2", "a3", "b", "b1", "b2", "root"],
            vec!["b", "b1", "b2", "root"],
            vec!["c", "root2"],
        ];

        for (batch, expected) in batches.into_iter().zip(expected_ids) {
            harness.session.apply_backend_update(BackendUpdate {
                render_updates: batch,
                ..BackendUpdate::default()
            });

            let session = &harness.session;
            assert_eq!(session.index(), &build_index(session.tree()));
            let mut live = Vec::new();
            session.tree().walk(|_, key, node| {
                if !node.is_anonymous() {
                    assert_eq!(session.index().get(&node.id), Some(key));
                    live.push(node.id.clone());
                }
            });
            live.sort();
            let mut indexed: Vec<_> = session.index().ids().map(str::to_string).collect();
            indexed.sort();
            assert_eq!(live, indexed);
            assert_eq!(live, expected);
            assert!(session.index().duplicates().is_empty());
        }
        assert!(!harness.session.index().contains("ghost"));
    }

    #[test]
    fn dispose_ignores_dangling_response_and_notifies_remote() {
        let mut harness = Harness::new();
        harness.session.start();
        let request_id = harness.last_request_id();

        harness.session.dispose();
        harness.respond(
            request_id,
            BackendUpdate {
                render_updates: vec![VDomRenderUpdate::root(VDomElem::new("r", "div"))],
                ..BackendUpdate::default()
            },
        );

        assert!(harness.session.snapshot().is_none());
        assert!(!harness.alarm.is_armed());
        let sent = harness.sent();
        assert!(sent.last().expect("dispose sent").dispose);

        harness.session.report_event(click("r"));
        harness.session.report_handle_attach("h1", Some(Box::new(FocusCounter(Rc::new(Cell::new(0))))));
        assert_eq!(harness.sent().len(), sent.len());
        assert!(harness.session.pending().events.is_empty());
        assert!(harness.session.pending().ref_updates.is_empty());
        assert!(!harness.session.pending().has_news());
    }

    #[test]
    fn focus_operations_resolve_root_and_handles() {
        let mut harness = Harness::started_with(VDomElem::new("root", "div").with_child(
            VDomElem::new("in1", "input").with_prop(
                "ref",
                PropValue::Handle(HandleRef {
                    id: "h1".to_string(),
                    track_position: false,
                }),
            ),
        ));
        harness.session.render_props("in1");

        let root_focus = Rc::new(Cell::new(0));
        let input_focus = Rc::new(Cell::new(0));
        harness
            .session
            .attach_root_element(Some(Box::new(FocusCounter(root_focus.clone()))));

        let focus = |ref_id: &str| VDomRefOperation {
            ref_id: ref_id.to_string(),
            op: REF_OP_FOCUS.to_string(),
            params: Vec::new(),
        };

        harness.session.apply_backend_update(BackendUpdate {
            ref_operations: vec![focus("C1:root"), focus("h1"), focus("nope")],
            ..BackendUpdate::default()
        });
        assert_eq!(root_focus.get(), 1);
        assert_eq!(harness.session.diagnostics().len(), 2, "unmounted h1 and unknown id");

        harness
            .session
            .report_handle_attach("h1", Some(Box::new(FocusCounter(input_focus.clone()))));
        assert_eq!(harness.session.pending().ref_updates.len(), 1);

        harness.session.apply_backend_update(BackendUpdate {
            ref_operations: vec![
                focus("h1"),
                VDomRefOperation {
                    op: "scrollIntoView".to_string(),
                    ..focus("h1")
                },
            ],
            ..BackendUpdate::default()
        });
        assert_eq!(input_focus.get(), 1);
        assert_eq!(harness.session.diagnostics().len(), 3);
    }

    #[test]
    fn handler_respects_key_filter_and_reports_flags() {
        let handler = PropValue::Func(FuncRef {
            keys: vec!["Enter".to_string()],
            prevent_default: true,
            ..FuncRef::default()
        });
        let mut harness =
            Harness::started_with(VDomElem::new("in1", "input").with_prop("onKeyDown", handler));

        let ignored = harness.session.fire_handler(
            "in1",
            "onKeyDown",
            "keydown",
            EventDetail::key_down("x"),
        );
        assert!(!ignored.fired);
        assert!(harness.session.pending().events.is_empty());

        let fired = harness.session.fire_handler(
            "in1",
            "onKeyDown",
            "keydown",
            EventDetail::key_down("Enter"),
        );
        assert!(fired.fired);
        assert!(fired.prevent_default);
        assert!(!fired.stop_propagation);
        let sent = harness.sent();
        let events = &sent.last().expect("round sent").events;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "onKeyDown");
        assert_eq!(events[0].detail.key(), Some("Enter"));
    }

    #[test]
    fn handler_event_carries_prop_name_and_global_event() {
        let handler = PropValue::Func(FuncRef {
            global_event: "onPanelKey".to_string(),
            ..FuncRef::default()
        });
        let mut harness =
            Harness::started_with(VDomElem::new("b1", "button").with_prop("onClick", handler));

        let fired = harness
            .session
            .fire_handler("b1", "onClick", "click", EventDetail::default());

        assert!(fired.fired);
        let sent = harness.sent();
        let event = &sent.last().expect("round sent").events[0];
        assert_eq!(event.node_id, "b1");
        assert_eq!(event.event_type, "onClick");
        assert_eq!(event.global_event_type, "onPanelKey");
    }

    #[test]
    fn removed_nodes_release_their_bindings() {
        let mut harness = Harness::started_with(
            VDomElem::new("root", "div").with_child(VDomElem::new("x", "span").with_prop("v", binding("b"))),
        );
        harness.session.render_props("x");
        assert!(harness.session.bindings().get("b").expect("b").is_consumer("x"));

        harness.session.apply_backend_update(BackendUpdate {
            render_updates: vec![VDomRenderUpdate::remove("root", 0)],
            ..BackendUpdate::default()
        });

        assert!(!harness.session.bindings().get("b").expect("b").is_consumer("x"));
        assert!(!harness.session.index().contains("x"));
    }

    #[test]
    fn local_binding_write_is_sent_as_state_sync() {
        let mut harness = Harness::started_with(VDomElem::new("root", "div"));
        harness.session.set_binding_value("draft", json!("hello"));

        assert!(harness.alarm.fire());
        harness.session.on_alarm();

        let sent = harness.sent();
        let last = sent.last().expect("round sent");
        assert_eq!(last.state_sync.len(), 1);
        assert_eq!(last.state_sync[0].name, "draft");
        assert_eq!(last.state_sync[0].value, json!("hello"));
    }

    #[test]
    fn remote_messages_and_local_violations_are_logged() {
        let mut harness = Harness::started_with(VDomElem::new("root", "div"));
        harness.session.apply_backend_update(BackendUpdate {
            render_updates: vec![VDomRenderUpdate::insert("root", 3, VDomElem::new("x", "p"))],
            messages: vec![VDomMessage {
                message_type: "error".to_string(),
                message: "render panicked".to_string(),
                stack_trace: Some("at app.go:10".to_string()),
                params: Vec::new(),
            }],
            ..BackendUpdate::default()
        });

        assert_eq!(harness.session.diagnostics().len(), 2);
        harness.session.report_event(click("root"));
        let sent = harness.sent();
        let forwarded = &sent.last().expect("round sent").messages;
        assert_eq!(forwarded.len(), 1);
        assert!(forwarded[0].message.contains("skipped render update"));
    }

    #[test]
    fn reset_discards_tree_and_requests_resync() {
        let mut harness = Harness::started_with(VDomElem::new("root", "div"));
        harness.session.reset();

        assert!(harness.session.snapshot().is_none());
        let sent = harness.sent();
        assert!(sent.last().expect("resync sent").resync);
    }

    #[test]
    fn outline_shows_resolved_props_and_text() {
        let mut harness = Harness::started_with(
            VDomElem::new("root", "div")
                .with_prop("title", binding("t"))
                .with_child(VDomElem::text("hi")),
        );
        harness.session.apply_backend_update(BackendUpdate {
            state_sync: vec![VDomStateSync {
                name: "t".to_string(),
                value: json!("Hello"),
            }],
            ..BackendUpdate::default()
        });

        let outline = harness.session.render_outline();
        assert_eq!(outline, "<div #root title=\"Hello\">\n  \"hi\"\n");
    }
}
