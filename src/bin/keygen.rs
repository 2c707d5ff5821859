//! Ed25519 identity generator for dsn nodes.
//!
//! Writes a protobuf-encoded keypair to `<output-dir>/node_key` and prints
//! the resulting peer id.
//!
//! Usage:
//!   cargo run --bin dsn-keygen [output-dir]

use color_eyre::eyre::{bail, WrapErr};
use dsn_node::identity::{PeerIdentity, KEY_FILE_NAME};
use std::env;
use std::path::PathBuf;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let output_dir = match env::args().nth(1) {
        Some(dir) => PathBuf::from(dir),
        None => env::current_dir().wrap_err("reading current directory")?,
    };
    let key_path = output_dir.join(KEY_FILE_NAME);
    if key_path.exists() {
        bail!("{} already exists; refusing to overwrite", key_path.display());
    }

    let identity = PeerIdentity::generate();
    identity
        .save(&key_path)
        .wrap_err_with(|| format!("writing {}", key_path.display()))?;

    println!("Node key saved to: {}", key_path.display());
    println!("Peer id: {}", identity.peer_id());
    Ok(())
}
