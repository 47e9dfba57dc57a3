use clap::Parser;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use sluice::{BoxError, Handler, LoggingFilter, Message, Session, SessionId};
use sluice_bootstrap::TcpServerBuilder;
use sluice_codec::LineCodecFilter;
use sluice_executor::{ExecutorBuilder, ExecutorFilter};

////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct Shared {
    peers: Mutex<HashMap<SessionId, Weak<Session>>>,
}

impl Shared {
    fn contains(&self, id: SessionId) -> bool {
        self.peers.lock().map(|p| p.contains_key(&id)).unwrap_or(false)
    }

    fn join(&self, session: &Arc<Session>) {
        info!("{} joined", session.id());
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(session.id(), Arc::downgrade(session));
        }
    }

    fn leave(&self, id: SessionId) {
        info!("{} left", id);
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&id);
        }
    }

    /// Send message to every peer, except for the sender.
    fn broadcast(&self, sender: SessionId, line: String) {
        let targets: Vec<Arc<Session>> = match self.peers.lock() {
            Ok(peers) => peers
                .iter()
                .filter(|(id, _)| **id != sender)
                .filter_map(|(_, peer)| peer.upgrade())
                .collect(),
            Err(_) => return,
        };
        for peer in targets {
            if let Err(err) = peer.write(Message::new(line.clone())) {
                warn!("broadcast to {} failed: {}", peer.id(), err);
            }
        }
    }
}

struct ChatHandler {
    state: Arc<Shared>,
}

impl Handler for ChatHandler {
    fn session_opened(&self, session: &Arc<Session>) -> Result<(), BoxError> {
        self.state.join(session);
        Ok(())
    }

    fn session_closed(&self, session: &Arc<Session>) -> Result<(), BoxError> {
        if self.state.contains(session.id()) {
            self.state.leave(session.id());
        }
        Ok(())
    }

    fn message_received(&self, session: &Arc<Session>, message: Message) -> Result<(), BoxError> {
        let line = message
            .downcast_ref::<String>()
            .ok_or("chat server expects lines")?;
        let from = session
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| session.id().to_string());
        info!("received: {} from {}", line, from);
        self.state.broadcast(session.id(), format!("{from}: {line}"));
        Ok(())
    }
}

#[derive(Parser)]
#[command(name = "Chat Server")]
#[command(author = "Rusty Rain <y@liu.mx>")]
#[command(version = "0.0.0")]
#[command(about = "An example of chat server over TCP", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("0.0.0.0"))]
    host: String,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
    #[arg(long, default_value_t = 64)]
    max_threads: usize,
    #[arg(long, default_value_t = 2)]
    workers: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    demos::init_logging(cli.debug, &cli.log_level)?;

    // Ordered dispatch keeps each peer's lines in the order they were typed.
    let executor = Arc::new(
        ExecutorBuilder::new()
            .name("chat-executor")
            .worker_count(cli.workers)
            .build()?,
    );
    let state = Arc::new(Shared::default());

    let server = {
        let executor = Arc::clone(&executor);
        TcpServerBuilder::new()
            .name("chat-server")
            .max_pool_size(cli.max_threads)
            .chain(move |session| {
                let chain = session.chain();
                chain.add_last("codec", Arc::new(LineCodecFilter::default()))?;
                chain.add_last("logging", Arc::new(LoggingFilter::new()))?;
                chain.add_last(
                    "executor",
                    Arc::new(ExecutorFilter::new(Arc::clone(&executor))),
                )
            })
            .handler(Arc::new(ChatHandler { state }))
            .bind(format!("{}:{}", cli.host, cli.port))?
    };

    println!("listening {}...", server.local_addr());
    println!("Press Ctrl-C to stop");
    println!(
        "try `nc {} {}` in another shell",
        server.local_addr().ip(),
        server.local_addr().port()
    );

    let stop_rx = demos::stop_signal()?;
    let _ = stop_rx.recv();

    println!("Wait for Gracefully Shutdown...");
    server.stop();
    executor.shutdown();
    println!("Server is Gracefully Shutdown Completed");

    Ok(())
}
