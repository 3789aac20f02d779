use std::env::args;
use std::process::exit;

use tokio_jabber::{AuthStrategy, BoshConfig, BoshSession};

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = args().collect();
    if args.len() < 3 || args.len() > 5 {
        println!("Usage: {} <jid> <password> [<bosh-host>] [legacy]", args[0]);
        exit(1);
    }
    let jid = &args[1];
    let password = &args[2];

    let mut config = BoshConfig::default();
    if let Some(host) = args.get(3) {
        config = config.with_domain(host.as_str());
    }
    if args.get(4).map(String::as_str) == Some("legacy") {
        config = config.with_auth(AuthStrategy::LegacyDigest);
    }
    println!("Binding {} through {}", jid, config.url());

    match BoshSession::bind(jid, password, config).await {
        Ok(session) => {
            println!("Session is alive: {}", session.is_alive());
            println!("sid: {}", session.sid().unwrap_or("none"));
            println!("rid: {}", session.rid());
            match session.bound_jid() {
                Some(full) => println!("bound as {}", full),
                None => println!("bound as {}", session.jid()),
            }
        }
        Err(e) => {
            println!("Failed to bind: {}", e);
            exit(1);
        }
    }
}
