use std::env;

fn main() {
    let default_ssh = env::var("FLEETMUX_SSH_EXEC").unwrap_or_else(|_| "ssh".into());
    let default_sshpass = env::var("FLEETMUX_SSHPASS_EXEC").unwrap_or_else(|_| "sshpass".into());

    println!("cargo::rerun-if-env-changed=FLEETMUX_SSH_EXEC");
    println!("cargo::rerun-if-env-changed=FLEETMUX_SSHPASS_EXEC");
    println!("cargo::rustc-env=FLEETMUX_SSH_EXEC={}", default_ssh);
    println!("cargo::rustc-env=FLEETMUX_SSHPASS_EXEC={}", default_sshpass);
}
