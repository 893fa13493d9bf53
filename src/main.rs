use std::io::{Read, Write};
use std::sync::Arc;

use warden::{Config, Daemon, RequestIo, RequestInfo};

fn handle(request: &RequestInfo, io: &Arc<RequestIo>) {
    match request.path.as_str() {
        "/" => io.attach_text(200, "Hello!\n"),

        // Streams the request body back, compressed per negotiation. The
        // upload is drained first: once output streaming starts, the request
        // body can no longer be read.
        "/echo" => {
            let handle = Arc::clone(io);
            io.run_async(move || {
                let io = handle;
                let encoding = io.request().encoding;
                io.add_encoding_header(encoding);

                let mut body = Vec::new();
                let mut reader = io.open_for_read(64 * 1024 * 1024);
                if let Err(err) = reader.read_to_end(&mut body) {
                    io.record_error(format!("echo read failed: {err}"));
                    return;
                }

                let mut writer = io.open_for_write(200, encoding);
                if let Err(err) = writer.write_all(&body).and_then(|_| writer.finish()) {
                    io.record_error(format!("echo write failed: {err}"));
                }
            });
        }

        // Echoes websocket messages until the client closes.
        "/ws" => {
            let handle = Arc::clone(io);
            io.run_async(move || {
                let io = handle;
                let (mut reader, writer) = match io.upgrade_websocket(true) {
                    Ok(pair) => pair,
                    Err(err) => {
                        io.record_error(format!("upgrade failed: {err}"));
                        return;
                    }
                };

                loop {
                    match reader.read_message() {
                        Ok(Some(msg)) => {
                            if writer.write_message(&msg.data, msg.text).is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            let _ = writer.close();
                            return;
                        }
                        Err(_) => return,
                    }
                }
            });
        }

        _ => io.attach_error(404, None),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let config = Config::load()?;

    let mut daemon = Daemon::new();
    daemon.start(&config, handle)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(tokio::signal::ctrl_c())?;
    tracing::info!("shutdown signal received");

    daemon.stop();
    Ok(())
}
