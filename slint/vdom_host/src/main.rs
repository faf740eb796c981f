use slint::ComponentHandle;
use std::process;
use tracing_subscriber::EnvFilter;
use vdom_host_runtime::PanelBindings;

slint::include_modules!();

struct HostPanelBindings;

impl PanelBindings for HostPanelBindings {
    type Ui = HostPanel;

    fn new_ui() -> Result<Self::Ui, slint::PlatformError> {
        HostPanel::new()
    }

    fn bind_inbox_ready<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn() + 'static,
    {
        ui.on_inbox_ready(handler);
    }

    fn invoke_inbox_ready(ui: &Self::Ui) {
        ui.invoke_inbox_ready();
    }

    fn bind_node_activated<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(String) + 'static,
    {
        ui.on_node_activated(move |node_id| handler(node_id.to_string()));
    }

    fn bind_key_pressed<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(String, String) -> bool + 'static,
    {
        ui.on_key_pressed(move |node_id, key| handler(node_id.to_string(), key.to_string()));
    }

    fn bind_focus_changed<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(bool) + 'static,
    {
        ui.on_focus_changed(handler);
    }

    fn bind_resized<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(f32, f32) + 'static,
    {
        ui.on_resized(handler);
    }

    fn bind_reset_requested<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn() + 'static,
    {
        ui.on_reset_requested(handler);
    }

    fn panel_size(ui: &Self::Ui) -> (f32, f32) {
        let size = ui.window().size().to_logical(ui.window().scale_factor());
        (size.width, size.height)
    }

    fn set_tree_outline(ui: &Self::Ui, outline: &str) {
        ui.set_tree_outline(outline.into());
    }

    fn set_diagnostics_text(ui: &Self::Ui, text: &str) {
        ui.set_diagnostics_text(text.into());
    }

    fn set_status_text(ui: &Self::Ui, text: &str) {
        ui.set_status_text(text.into());
    }

    fn focus_panel(ui: &Self::Ui) {
        ui.invoke_focus_panel();
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = vdom_host_runtime::run::<HostPanelBindings>() {
        eprintln!("vdom_host fatal error: {err}");
        process::exit(1);
    }
}
