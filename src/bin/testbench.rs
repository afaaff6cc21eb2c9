//! Local end-to-end bench for the relay pipeline.
//!
//! Runs the whole stack against an in-process channel device and a loopback
//! echo server: craft an outbound packet as the OS would, watch it get
//! relayed, and print the synthesized reply that comes back through the
//! tunnel. No real network interface is touched.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use env_logger::Env;

use tunrelay::tunnel::{channel_device, ChannelDevice};
use tunrelay::{
    decode_outbound, encode_reply, RelayResult, TunnelConfig, TunnelDevice, TunnelManager,
    TunnelProvider,
};

/// Hands out the single pre-built channel device
struct BenchProvider {
    device: Mutex<Option<Arc<ChannelDevice>>>,
}

impl TunnelProvider for BenchProvider {
    fn open(&self, _config: &TunnelConfig) -> RelayResult<Arc<dyn TunnelDevice>> {
        let device = self
            .device
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                tunrelay::RelayError::TunnelEstablishFailure("bench device already used".into())
            })?;
        Ok(device as Arc<dyn TunnelDevice>)
    }
}

fn spawn_echo_server() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("bind echo server")?;
    let port = listener.local_addr()?.port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    let mut reply = b"echo: ".to_vec();
                    reply.extend_from_slice(&buf[..n]);
                    if stream.write_all(&reply).is_err() {
                        break;
                    }
                }
            });
        }
    });
    Ok(port)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let echo_port = spawn_echo_server()?;
    log::info!("echo server on 127.0.0.1:{}", echo_port);

    let (device, host) = channel_device(64);
    let provider = BenchProvider {
        device: Mutex::new(Some(device)),
    };

    let config = TunnelConfig::default();
    let local_addr = config.local_addr;
    let mut manager = TunnelManager::new(Box::new(provider), config);
    manager
        .establish(Ipv4Addr::new(8, 8, 8, 8))
        .context("establish tunnel")?;

    // As the OS would: route one TCP packet from the local tunnel address
    // into the device.
    let outbound = encode_reply(
        local_addr,
        5000,
        Ipv4Addr::LOCALHOST,
        echo_port,
        b"hello through the tunnel",
    );
    if !host.send_packet(outbound) {
        anyhow::bail!("device rejected the outbound packet");
    }

    let reply = host
        .recv_reply(Duration::from_secs(5))
        .context("no reply packet within 5s")?;
    let parsed = decode_outbound(&reply).context("reply packet did not parse")?;
    log::info!(
        "reply from {}:{} -> {}:{}: {:?}",
        parsed.src_ip,
        parsed.src_port,
        parsed.dst_ip,
        parsed.dst_port,
        String::from_utf8_lossy(&parsed.payload)
    );

    log::info!(
        "liveness={} active_flows={}",
        manager.liveness(),
        manager.active_flows()
    );

    manager.shutdown();
    Ok(())
}
