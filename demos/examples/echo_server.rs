use clap::Parser;
use log::info;
use std::sync::Arc;
use std::time::Duration;

use sluice::{BoxError, Handler, IdleStatus, LoggingFilter, Message, Session};
use sluice_bootstrap::TcpServerBuilder;
use sluice_codec::LineCodecFilter;
use sluice_executor::{Discipline, ExecutorBuilder, ExecutorFilter};

////////////////////////////////////////////////////////////////////////////////////////////////////

struct EchoHandler;

impl Handler for EchoHandler {
    fn session_opened(&self, session: &Arc<Session>) -> Result<(), BoxError> {
        session.write(Message::new(format!(
            "welcome, you are session {}",
            session.id()
        )))?;
        Ok(())
    }

    fn session_idle(&self, session: &Arc<Session>, status: IdleStatus) -> Result<(), BoxError> {
        info!("session {} is {:?}, closing", session.id(), status);
        session.close();
        Ok(())
    }

    fn message_received(&self, session: &Arc<Session>, message: Message) -> Result<(), BoxError> {
        let line = message
            .downcast_ref::<String>()
            .ok_or("echo server expects lines")?;
        match line.trim() {
            "bye" => session.close(),
            _ => session.write(Message::new(line.clone()))?,
        }
        Ok(())
    }
}

#[derive(Parser)]
#[command(name = "Echo Server")]
#[command(author = "Rusty Rain <y@liu.mx>")]
#[command(version = "0.0.0")]
#[command(about = "An example of line echo server over a dispatch executor", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("0.0.0.0"))]
    host: String,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
    /// Maximum number of connections served at once.
    #[arg(long, default_value_t = 16)]
    max_threads: usize,
    /// Executor worker threads; 0 handles events on the connection thread.
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Keep events of one session in order.
    #[arg(long)]
    ordered: bool,
    /// Seconds a connection may stay quiet before it is closed.
    #[arg(long)]
    idle_secs: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    demos::init_logging(cli.debug, &cli.log_level)?;

    let executor = if cli.workers > 0 {
        let discipline = if cli.ordered {
            Discipline::Ordered
        } else {
            Discipline::Unordered
        };
        Some(Arc::new(
            ExecutorBuilder::new()
                .name("echo-executor")
                .worker_count(cli.workers)
                .discipline(discipline)
                .build()?,
        ))
    } else {
        None
    };

    let server = {
        let executor = executor.clone();
        TcpServerBuilder::new()
            .name("echo-server")
            .max_pool_size(cli.max_threads)
            .idle_time(cli.idle_secs.map(Duration::from_secs))
            .chain(move |session| {
                let chain = session.chain();
                chain.add_last("codec", Arc::new(LineCodecFilter::default()))?;
                chain.add_last("logging", Arc::new(LoggingFilter::new()))?;
                if let Some(executor) = &executor {
                    chain.add_last(
                        "executor",
                        Arc::new(ExecutorFilter::new(Arc::clone(executor))),
                    )?;
                }
                Ok(())
            })
            .handler(Arc::new(EchoHandler))
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
    if let Some(executor) = executor {
        executor.shutdown();
    }
    println!(
        "Server is Gracefully Shutdown Completed, served at most {} connections at once",
        server.stats().peak_pool_size()
    );

    Ok(())
}
