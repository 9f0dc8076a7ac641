use std::env;

fn main() {
    // Check if MAILSUBMIT_CONFIG_PATH is set; if not, use a default value
    let config_path = env::var("MAILSUBMIT_CONFIG_PATH").unwrap_or_else(|_| "/etc/mailsubmit.conf".to_string());

    // Tell Cargo to rerun this build script if the environment variable changes
    println!("cargo:rerun-if-env-changed=MAILSUBMIT_CONFIG_PATH");

    // Pass the value to the Rust code by emitting a cargo instruction
    println!("cargo:rustc-env=MAILSUBMIT_CONFIG_PATH={}", config_path);
}
