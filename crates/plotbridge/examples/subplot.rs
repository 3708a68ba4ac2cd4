//! Subplot example: a session with an in-process companion.
//!
//! The companion runs on a thread and prints what it receives, doubling the
//! `weights` buffer it is asked to send back.
//!
//! Run with:
//!   cargo run --example subplot

use std::thread::{self, JoinHandle};
use std::time::Duration;

use plotbridge::session::{HandshakeConfig, LaunchRequest, Result};
use plotbridge::{Arg, CompanionClient, CompanionEvent, Launcher, Session, SessionConfig};

/// Starts the companion on a thread instead of a child process.
#[derive(Default)]
struct ThreadLauncher {
    handle: Option<JoinHandle<()>>,
}

impl Launcher for ThreadLauncher {
    fn launch(&mut self, request: &LaunchRequest<'_>) -> Result<Option<u32>> {
        let endpoint = request.endpoint.to_path_buf();
        let reply_endpoint = request.reply_endpoint.map(|path| path.to_path_buf());
        self.handle = Some(thread::spawn(move || {
            if let Err(err) = companion(&endpoint, reply_endpoint.as_deref()) {
                eprintln!("[companion] {err}");
            }
        }));
        Ok(None)
    }

    fn reap(&mut self, _grace: Duration) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn companion(endpoint: &std::path::Path, reply_endpoint: Option<&std::path::Path>) -> Result<()> {
    let mut client = CompanionClient::connect(endpoint, reply_endpoint, &HandshakeConfig::default())?;

    while let CompanionEvent::Batch(batch) = client.next_event()? {
        for binding in &batch.bindings {
            eprintln!(
                "[companion] {} {} {}",
                binding.name(),
                binding.header.dtype,
                binding.header.shape
            );
        }
        eprint!("{}", batch.script);

        for binding in batch.reply_requests() {
            let doubled: Vec<u8> = binding
                .values::<f64>()?
                .into_iter()
                .flat_map(|value| (value * 2.0).to_ne_bytes())
                .collect();
            client.send_reply(binding.name(), &doubled)?;
        }
    }
    Ok(())
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("plotbridge-subplot-{}", std::process::id()));
    std::fs::create_dir_all(&sock_dir)?;

    let config = SessionConfig::default()
        .with_endpoint(sock_dir.join("subplot.sock"))
        .with_duplex();
    let mut session = Session::with_launcher(config, ThreadLauncher::default());
    session.establish()?;

    let t: Vec<f64> = (0..50).map(|i| f64::from(i) * 0.1).collect();
    let rows: Vec<Vec<f64>> = vec![
        t.iter().map(|v| v.sin()).collect(),
        t.iter().map(|v| v.cos()).collect(),
    ];
    let title = String::from("sin and cos");
    let mut weights = vec![0.25f64, 0.75];

    session.push("import matplotlib.pyplot as plt");
    session.raw_with(
        "
        fig, axes = plt.subplots(2, 1)
        for ax, row, w in zip(axes, rows, weights):
            ax.plot(t, row * w)
        fig.suptitle(title)
        plt.show()
        ",
        &mut [
            Arg::new("t", &t),
            Arg::new("rows", &rows),
            Arg::new("title", &title),
            Arg::send_back("weights", &mut weights),
        ],
    )?;
    println!("weights after reply: {weights:?}");

    session.teardown()?;
    let _ = std::fs::remove_dir_all(&sock_dir);
    Ok(())
}
