//! Mint a development access token for the chat gateway.
//!
//! Usage:
//!   cargo run -p chat-gateway --bin chat-mint-token -- <user_id> [ttl_minutes]
//!
//! Reads JWT_SIGNING_KEY from the environment (or .env via dotenvy).

use std::path::Path;

use chat_gateway::auth::tokens::{mint_access_token, ACCESS_TOKEN_TTL_SECS};

fn main() {
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    let mut args = std::env::args().skip(1);
    let user_id: i64 = args
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| usage());
    let ttl = match args.next() {
        Some(minutes) => chrono::Duration::minutes(minutes.parse().unwrap_or_else(|_| usage())),
        None => chrono::Duration::seconds(ACCESS_TOKEN_TTL_SECS),
    };

    let secret = std::env::var("JWT_SIGNING_KEY").expect("JWT_SIGNING_KEY env var is required");
    let token = mint_access_token(secret.as_bytes(), user_id, ttl).expect("failed to sign token");

    println!("{token}");
}

fn usage() -> ! {
    eprintln!("usage: chat-mint-token <user_id> [ttl_minutes]");
    std::process::exit(2);
}
