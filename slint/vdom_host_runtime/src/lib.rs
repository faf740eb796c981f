pub mod binding;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod handle;
pub mod patch;
pub mod protocol;
pub mod revision;
pub mod scheduler;
pub mod session;
pub mod timer;
pub mod transport;
pub mod tree;
pub mod value;

use crate::diagnostics::{DiagnosticLog, Origin};
use crate::protocol::{
    INBOUND_FRAME_CAP, OUTBOUND_FRAME_CAP, reader_loop, writer_loop,
};
use crate::timer::SlintAlarm;
use slint::ComponentHandle;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

pub use crate::config::HostConfig;
pub use crate::error::{ConfigError, FrameError, NativeOpError, TransportError};
pub use crate::handle::NativeElement;
pub use crate::protocol::{
    BackendEnvelope, BackendUpdate, EventDetail, FrontendEnvelope, FrontendUpdate, KeyData,
    PointerData, VDomEvent, VDomRenderUpdate,
};
pub use crate::session::{HandlerOutcome, ResolvedValue, Transport, TreeSession};
pub use crate::transport::ChannelTransport;
pub use crate::tree::VDomElem;
pub use crate::value::PropValue;
pub use serde_json;

const DIAGNOSTICS_SHOWN: usize = 20;
const WRITER_DRAIN_POLLS: u32 = 50;

/// Glue between the runtime and a concrete Slint panel component.
pub trait PanelBindings: 'static {
    type Ui: ComponentHandle + 'static;

    fn new_ui() -> Result<Self::Ui, slint::PlatformError>;

    fn bind_inbox_ready<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn() + 'static;

    fn invoke_inbox_ready(ui: &Self::Ui);

    fn bind_node_activated<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(String) + 'static;

    /// `handler` returns whether the key was consumed.
    fn bind_key_pressed<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(String, String) -> bool + 'static;

    fn bind_focus_changed<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(bool) + 'static;

    fn bind_resized<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(f32, f32) + 'static;

    fn bind_reset_requested<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn() + 'static;

    fn panel_size(ui: &Self::Ui) -> (f32, f32);
    fn set_tree_outline(ui: &Self::Ui, outline: &str);
    fn set_diagnostics_text(ui: &Self::Ui, text: &str);
    fn set_status_text(ui: &Self::Ui, text: &str);
    fn focus_panel(ui: &Self::Ui);
}

/// The panel's own element, addressed by the root handle id.
struct PanelRoot<B: PanelBindings> {
    ui: slint::Weak<B::Ui>,
}

impl<B: PanelBindings> NativeElement for PanelRoot<B> {
    fn focus(&self) -> Result<(), NativeOpError> {
        let ui = self.ui.upgrade().ok_or(NativeOpError::NotMounted)?;
        B::focus_panel(&ui);
        Ok(())
    }
}

type Inbox = Arc<Mutex<VecDeque<BackendEnvelope>>>;

/// What the panel currently shows: (revision epoch, diagnostics total).
type Shown = Rc<Cell<Option<(u64, u64)>>>;

pub fn run<B: PanelBindings>() -> Result<(), Box<dyn std::error::Error>> {
    let config = HostConfig::load()?;
    info!(?config, "loaded host config");

    let ui = B::new_ui()?;
    let ui_weak = ui.as_weak();
    let (tx, rx) = mpsc::sync_channel(config.outbound_queue_cap);
    let inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
    let shown: Shown = Rc::new(Cell::new(None));

    let writer_handle = thread::spawn(move || {
        let mut stdout = std::io::stdout().lock();
        writer_loop(&mut stdout, rx, OUTBOUND_FRAME_CAP)
    });

    let session = Rc::new_cyclic(|weak: &std::rc::Weak<RefCell<TreeSession>>| {
        let alarm_session = weak.clone();
        let alarm_ui = ui.as_weak();
        let alarm_shown = shown.clone();
        let alarm = SlintAlarm::new(move || {
            let Some(session) = alarm_session.upgrade() else {
                return;
            };
            session.borrow_mut().on_alarm();
            if let Some(ui) = alarm_ui.upgrade() {
                refresh_panel::<B>(&ui, &session, &alarm_shown);
            }
        });
        let transport = ChannelTransport::new(tx.clone(), config.outbound_queue_cap);
        RefCell::new(TreeSession::new(
            config.clone(),
            Box::new(alarm),
            Box::new(transport),
        ))
    });

    install_callbacks::<B>(&ui, &session, &inbox, &shown);

    {
        let mut session = session.borrow_mut();
        session.attach_root_element(Some(Box::new(PanelRoot::<B> { ui: ui.as_weak() })));
        let (width, height) = B::panel_size(&ui);
        session.set_panel_size(to_pixels(width), to_pixels(height));
        session.start();
    }
    refresh_panel::<B>(&ui, &session, &shown);

    let reader_inbox = inbox.clone();
    let reader_handle = thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let read_result = reader_loop(&mut stdin, INBOUND_FRAME_CAP, |decoded| match decoded {
            Ok(envelope) => {
                match reader_inbox.lock() {
                    Ok(mut queue) => queue.push_back(envelope),
                    Err(_) => {
                        error!("backend inbox lock poisoned; dropping envelope");
                        return;
                    }
                }
                let _ = ui_weak.upgrade_in_event_loop(|ui| B::invoke_inbox_ready(&ui));
            }
            Err(err) => warn!(%err, "discarding undecodable backend frame"),
        });

        if let Err(err) = &read_result {
            error!(%err, "reader loop terminated with error");
        }

        let quit_result = slint::invoke_from_event_loop(|| {
            let _ = slint::quit_event_loop();
        });
        if let Err(err) = quit_result {
            error!(%err, "failed to request UI event loop quit");
        }

        read_result
    });

    ui.run()?;

    session.borrow_mut().dispose();
    // Drop UI first so callback closures release their session clones, and
    // with them the transport's sender.
    drop(ui);
    drop(session);
    drop(tx);

    for _ in 0..WRITER_DRAIN_POLLS {
        if writer_handle.is_finished() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    if writer_handle.is_finished() {
        match writer_handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(%err, "writer thread returned error"),
            Err(err) => error!(?err, "writer thread join failed"),
        }
    } else {
        // Avoid hanging process exit on a blocked stdio write during teardown.
        warn!("writer thread still active during shutdown; skipping join");
    }

    if reader_handle.is_finished() {
        match reader_handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(%err, "reader thread returned error"),
            Err(err) => error!(?err, "reader thread join failed"),
        }
    } else {
        // Avoid hanging process exit on a blocked stdio read during teardown.
        warn!("reader thread still active during shutdown; skipping join");
    }

    Ok(())
}

fn install_callbacks<B: PanelBindings>(
    ui: &B::Ui,
    session: &Rc<RefCell<TreeSession>>,
    inbox: &Inbox,
    shown: &Shown,
) {
    let inbox_session = session.clone();
    let inbox_queue = inbox.clone();
    let inbox_ui = ui.as_weak();
    let inbox_shown = shown.clone();
    B::bind_inbox_ready(ui, move || {
        let envelopes: Vec<BackendEnvelope> = match inbox_queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => {
                error!("backend inbox lock poisoned");
                return;
            }
        };
        for envelope in envelopes {
            inbox_session.borrow_mut().deliver(envelope);
        }
        if let Some(ui) = inbox_ui.upgrade() {
            refresh_panel::<B>(&ui, &inbox_session, &inbox_shown);
        }
    });

    let click_session = session.clone();
    let click_ui = ui.as_weak();
    let click_shown = shown.clone();
    B::bind_node_activated(ui, move |node_id| {
        if node_id.is_empty() {
            return;
        }
        let outcome = click_session
            .borrow_mut()
            .fire_handler(&node_id, "onClick", "click", EventDetail::default());
        if !outcome.fired {
            info!(node_id = %node_id, "node has no click handler");
        }
        if let Some(ui) = click_ui.upgrade() {
            refresh_panel::<B>(&ui, &click_session, &click_shown);
        }
    });

    let key_session = session.clone();
    B::bind_key_pressed(ui, move |node_id, key| {
        if node_id.is_empty() {
            return false;
        }
        let outcome = key_session.borrow_mut().fire_handler(
            &node_id,
            "onKeyDown",
            "keydown",
            EventDetail::key_down(key),
        );
        outcome.prevent_default
    });

    let focus_session = session.clone();
    B::bind_focus_changed(ui, move |focused| {
        focus_session.borrow_mut().set_focused(focused);
    });

    let resize_session = session.clone();
    B::bind_resized(ui, move |width, height| {
        resize_session
            .borrow_mut()
            .set_panel_size(to_pixels(width), to_pixels(height));
    });

    let reset_session = session.clone();
    let reset_ui = ui.as_weak();
    let reset_shown = shown.clone();
    B::bind_reset_requested(ui, move || {
        reset_session.borrow_mut().reset();
        if let Some(ui) = reset_ui.upgrade() {
            refresh_panel::<B>(&ui, &reset_session, &reset_shown);
        }
    });
}

/// Pushes the outline and diagnostics into the panel when they changed since
/// the last refresh.
fn refresh_panel<B: PanelBindings>(ui: &B::Ui, session: &RefCell<TreeSession>, shown: &Shown) {
    let mut session = session.borrow_mut();
    let epoch = session.revision_epoch();
    let last = shown.get();

    if last.map(|(shown_epoch, _)| shown_epoch) != Some(epoch) {
        B::set_tree_outline(ui, &session.render_outline());
    }

    let total = session.diagnostics().total();
    if last.map(|(_, shown_total)| shown_total) != Some(total) {
        B::set_diagnostics_text(ui, &diagnostics_text(session.diagnostics()));
    }

    let in_flight = session
        .scheduler()
        .in_flight()
        .map_or_else(|| "idle".to_string(), |id| format!("round {id} in flight"));
    B::set_status_text(
        ui,
        &format!(
            "client {} | {} nodes | {in_flight}",
            session.config().client_id,
            session.index().len()
        ),
    );

    shown.set(Some((epoch, total)));
}

fn diagnostics_text(log: &DiagnosticLog) -> String {
    let skip = log.len().saturating_sub(DIAGNOSTICS_SHOWN);
    let mut text = String::new();
    for diagnostic in log.entries().skip(skip) {
        let origin = match diagnostic.origin {
            Origin::Local => "local",
            Origin::Remote => "remote",
        };
        let _ = writeln!(
            text,
            "[{}] {origin}: {}",
            diagnostic.severity.as_message_type(),
            diagnostic.message
        );
    }
    text
}

fn to_pixels(length: f32) -> u32 {
    if length.is_finite() && length > 0.0 {
        length.round() as u32
    } else {
        0
    }
}
