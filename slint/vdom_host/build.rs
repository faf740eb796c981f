fn main() {
    slint_build::compile("ui/host_panel.slint").expect("failed to compile host_panel.slint");
    println!("cargo:rerun-if-changed=ui/host_panel.slint");
}
