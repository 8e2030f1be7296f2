#![cfg(not(target_arch = "wasm32"))]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use apptrace_adapters::{
    decode_frames, register_builtin, HostBlock, HostWindow, MembufConfig, MembufLink, UartConfig,
    UartLine, FRAMED, MEMBUF, RAW, UART,
};
use apptrace_fabric::{
    ConfigKey, Deadline, Registry, Session, SessionParams, Timeout, TransportSettings,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::init_tracing;

fn registry() -> Registry {
    let mut registry = Registry::new();
    register_builtin(&mut registry);
    registry
}

fn membuf_session(link: &MembufLink) -> Result<Session> {
    let params = SessionParams::new(RAW, MEMBUF).with_transport_cfg(link);
    Session::open_in(&registry(), params).context("open raw/membuf session")
}

/// Runs `target` while a probe thread drains `host`; returns every block seen.
fn with_probe<F>(host: &HostWindow, target: F) -> Result<Vec<HostBlock>>
where
    F: FnOnce() -> Result<()>,
{
    let stop = AtomicBool::new(false);
    thread::scope(|scope| {
        let probe = scope.spawn(|| -> Result<Vec<HostBlock>> {
            let mut blocks = Vec::new();
            loop {
                let last_pass = stop.load(Ordering::Acquire);
                blocks.extend(host.drain_blocks()?);
                if last_pass {
                    return Ok(blocks);
                }
                thread::yield_now();
            }
        });
        let outcome = target();
        stop.store(true, Ordering::Release);
        let blocks = probe
            .join()
            .map_err(|_| anyhow::anyhow!("probe thread panicked"))??;
        outcome.map(|()| blocks)
    })
}

fn text(blocks: &[HostBlock]) -> String {
    let bytes: Vec<u8> = blocks.iter().flat_map(|b| b.payload.iter().copied()).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[test]
fn boot_log_reaches_an_attached_probe() -> Result<()> {
    init_tracing();
    let link = MembufLink::new(MembufConfig {
        capacity: 128,
        ..MembufConfig::default()
    })?;
    let host = link.host();
    host.attach();
    let session = membuf_session(&link)?;

    let blocks = with_probe(&host, || {
        for stage in ["rom", "bootloader", "app"] {
            session.write_fmt(
                format_args!("[boot] {stage} ok\n"),
                &mut Deadline::infinite(),
            )?;
        }
        session.flush(&mut Deadline::new(Timeout::Micros(2_000_000)))?;
        Ok(())
    })?;

    assert_eq!(
        text(&blocks),
        "[boot] rom ok\n[boot] bootloader ok\n[boot] app ok\n"
    );
    let stats = session.stats();
    assert_eq!(stats.writes, 3);
    assert_eq!(stats.flushes, 1);
    tracing::info!(?stats, "boot log delivered");
    Ok(())
}

#[test]
fn flush_threshold_skips_small_backlogs() -> Result<()> {
    let link = MembufLink::new(MembufConfig::default())?;
    let host = link.host();
    host.attach();
    let params = SessionParams::new(RAW, MEMBUF)
        .with_transport_cfg(&link)
        .with_settings(TransportSettings::new().with_flush_threshold(1024));
    let session = Session::open_in(&registry(), params)?;

    session.write(b"below threshold", &mut Deadline::infinite())?;
    // Nobody drains, so only the threshold lets this return in time.
    session.flush(&mut Deadline::immediate())?;
    ensure!(host.staged()? > 0, "backlog should still be staged");

    session.set_config(ConfigKey::FlushThreshold, 0)?;
    let err = session
        .flush(&mut Deadline::new(Timeout::Micros(500)))
        .unwrap_err();
    assert!(err.is_timeout());
    Ok(())
}

#[test]
fn probe_attaching_late_sees_only_new_data() -> Result<()> {
    let link = MembufLink::new(MembufConfig {
        capacity: 64,
        ..MembufConfig::default()
    })?;
    let host = link.host();
    let session = membuf_session(&link)?;

    for n in 0..20 {
        session.write_fmt(format_args!("early {n:02}\n"), &mut Deadline::infinite())?;
    }
    assert!(host.discarded() > 0);
    assert_eq!(session.stats().writes, 20);

    host.drain_bytes()?;
    host.attach();
    let blocks = with_probe(&host, || {
        session.write(b"late\n", &mut Deadline::infinite())?;
        session.flush(&mut Deadline::infinite())?;
        Ok(())
    })?;
    assert_eq!(text(&blocks), "late\n");
    Ok(())
}

#[test]
fn host_command_gets_a_reply() -> Result<()> {
    let link = MembufLink::new(MembufConfig {
        rx_capacity: 64,
        ..MembufConfig::default()
    })?;
    let host = link.host();
    host.attach();
    let session = membuf_session(&link)?;

    let blocks = with_probe(&host, || {
        ensure!(host.send(b"ping")? == 4, "command did not fit");
        let mut cmd = [0u8; 16];
        let n = session.read(&mut cmd, &mut Deadline::new(Timeout::Micros(1_000_000)))?;
        ensure!(&cmd[..n] == b"ping", "unexpected command");
        session.write(b"pong", &mut Deadline::infinite())?;
        session.flush(&mut Deadline::infinite())?;
        Ok(())
    })?;
    assert_eq!(text(&blocks), "pong");
    Ok(())
}

#[test]
fn framed_uart_keeps_per_writer_order_with_a_slow_host() -> Result<()> {
    init_tracing();
    let line = UartLine::new(UartConfig {
        staging_capacity: 256,
        tx_fifo_capacity: 8,
        ..UartConfig::default()
    })?;
    let params = SessionParams::new(FRAMED, UART).with_transport_cfg(&line);
    let session = Session::open_in(&registry(), params)?;

    const WRITERS: u8 = 3;
    const RECORDS: u16 = 100;
    let done = AtomicBool::new(false);

    let wire = thread::scope(|scope| -> Result<Vec<u8>> {
        let host = scope.spawn(|| {
            let mut wire = Vec::new();
            loop {
                let last_pass = done.load(Ordering::Acquire);
                let chunk = line.take_tx();
                if chunk.is_empty() && last_pass {
                    return wire;
                }
                wire.extend(chunk);
                thread::sleep(Duration::from_micros(20));
            }
        });

        let writers: Vec<_> = (0..WRITERS)
            .map(|id| {
                let session = &session;
                scope.spawn(move || -> Result<()> {
                    let mut rng = StdRng::seed_from_u64(u64::from(id) + 100);
                    for n in 0..RECORDS {
                        let mut record = vec![id];
                        record.extend_from_slice(&n.to_le_bytes());
                        record.resize(3 + rng.gen_range(0..20), 0xEE);
                        session.write(&record, &mut Deadline::infinite())?;
                    }
                    Ok(())
                })
            })
            .collect();
        for writer in writers {
            writer
                .join()
                .map_err(|_| anyhow::anyhow!("writer panicked"))??;
        }
        session.flush(&mut Deadline::infinite())?;
        done.store(true, Ordering::Release);
        host.join().map_err(|_| anyhow::anyhow!("host panicked"))
    })?;

    let (frames, rest) = decode_frames(&wire);
    ensure!(rest.is_empty(), "{} trailing bytes", rest.len());
    assert_eq!(frames.len(), usize::from(WRITERS) * usize::from(RECORDS));

    let mut next: HashMap<u8, u16> = HashMap::new();
    for (index, frame) in frames.iter().enumerate() {
        assert_eq!(frame.seq, index as u8, "sequence gap at record {index}");
        let id = frame.payload[0];
        let n = u16::from_le_bytes([frame.payload[1], frame.payload[2]]);
        let expected = next.entry(id).or_default();
        assert_eq!(n, *expected, "writer {id} reordered");
        *expected += 1;
    }
    Ok(())
}

#[test]
#[ignore]
fn slow_membuf_flood_with_random_sizes() -> Result<()> {
    init_tracing();
    let link = MembufLink::new(MembufConfig {
        capacity: 1024,
        header_size: 4,
        ..MembufConfig::default()
    })?;
    let host = link.host();
    host.attach();
    let session = membuf_session(&link)?;

    const WRITERS: u64 = 8;
    const RECORDS: usize = 20_000;
    let blocks = with_probe(&host, || {
        thread::scope(|scope| -> Result<()> {
            let writers: Vec<_> = (0..WRITERS)
                .map(|id| {
                    let session = &session;
                    scope.spawn(move || -> Result<()> {
                        let mut rng = StdRng::seed_from_u64(id);
                        for _ in 0..RECORDS {
                            let len = rng.gen_range(1..=200);
                            session.write(&vec![id as u8; len], &mut Deadline::infinite())?;
                        }
                        Ok(())
                    })
                })
                .collect();
            for writer in writers {
                writer
                    .join()
                    .map_err(|_| anyhow::anyhow!("writer panicked"))??;
            }
            Ok(())
        })?;
        session.flush(&mut Deadline::infinite())?;
        Ok(())
    })?;

    assert_eq!(blocks.len(), WRITERS as usize * RECORDS);
    for block in &blocks {
        let id = block.payload[0];
        ensure!(block.payload.iter().all(|&b| b == id), "torn block");
    }
    tracing::info!(blocks = blocks.len(), stats = ?session.stats(), "flood drained");
    Ok(())
}
