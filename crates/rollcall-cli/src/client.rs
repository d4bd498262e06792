//! Session control against a running `rollcalld` over D-Bus.

use anyhow::{Context, Result};
use futures_util::StreamExt;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1",
    gen_blocking = false
)]
trait Attendance {
    async fn start(&self) -> zbus::Result<String>;
    async fn stop(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn today_attendance(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn session_started(&self, enrolled: u32) -> zbus::Result<()>;
    #[zbus(signal)]
    fn session_ended(&self, reason: &str) -> zbus::Result<()>;
    #[zbus(signal)]
    fn attendance_marked(&self, id: &str, confidence: f64) -> zbus::Result<()>;
    #[zbus(signal)]
    fn already_marked(&self, id: &str) -> zbus::Result<()>;
    #[zbus(signal)]
    fn recognition_failed(&self, error: &str) -> zbus::Result<()>;
}

async fn connect() -> Result<AttendanceProxy<'static>> {
    let connection = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable (is the daemon running?)")
}

fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}

pub async fn start() -> Result<()> {
    let reply = connect().await?.start().await.context("Start failed")?;
    println!("{}", pretty(&reply));
    Ok(())
}

pub async fn stop() -> Result<()> {
    if connect().await?.stop().await.context("Stop failed")? {
        println!("Session stopped");
    } else {
        println!("No session was running");
    }
    Ok(())
}

pub async fn status() -> Result<()> {
    let reply = connect().await?.status().await.context("Status failed")?;
    println!("{}", pretty(&reply));
    Ok(())
}

/// Print session signals until the session ends.
pub async fn watch() -> Result<()> {
    let proxy = connect().await?;
    let mut started = proxy.receive_session_started().await?;
    let mut ended = proxy.receive_session_ended().await?;
    let mut marked = proxy.receive_attendance_marked().await?;
    let mut already = proxy.receive_already_marked().await?;
    let mut failed = proxy.receive_recognition_failed().await?;

    println!("Watching rollcalld (Ctrl-C to quit)");
    loop {
        tokio::select! {
            Some(signal) = started.next() => {
                let args = signal.args()?;
                println!("session started: {} enrolled", args.enrolled());
            }
            Some(signal) = marked.next() => {
                let args = signal.args()?;
                println!("marked     {} ({:.3})", args.id(), args.confidence());
            }
            Some(signal) = already.next() => {
                let args = signal.args()?;
                println!("already    {}", args.id());
            }
            Some(signal) = failed.next() => {
                let args = signal.args()?;
                eprintln!("recognition failed: {}", args.error());
            }
            Some(signal) = ended.next() => {
                let args = signal.args()?;
                println!("session ended: {}", args.reason());
                return Ok(());
            }
            else => anyhow::bail!("rollcalld went away"),
        }
    }
}
