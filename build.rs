//! Build script for zonewall
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `zonewall --version`.

fn main() {
    // Re-run build if the packaged default paths change
    println!("cargo:rerun-if-env-changed=ZONEWALL_DEFAULT_STATE_DIR");

    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
