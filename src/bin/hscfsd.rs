//! Smoke driver for the host-side core: formats an in-memory device, mounts
//! it, and runs through the create/write/read/mkdir/unlink/rmdir scenarios
//! over the POSIX shim, logging each step.

use clap::Parser;
use hscfs::shim::PosixShim;
use hscfs::{Config, FileSystemManager};
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    if config.verbose && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let device: Arc<dyn device::Device> = Arc::new(device::memory::MemoryDevice::format(64, 1024));
    let fsm = FileSystemManager::mount(device, config)?;
    let shim = PosixShim::new(fsm.clone());

    run_smoke_scenarios(&shim)?;

    fsm.shutdown();
    Ok(())
}

fn run_smoke_scenarios(shim: &PosixShim) -> anyhow::Result<()> {
    // S1: create and write a new file.
    let fd = shim.open("/hello.txt", libc::O_CREAT)?;
    let n = shim.write(fd, b"hscfs online\n")?;
    log::info!("S1: wrote {} bytes to /hello.txt", n);
    shim.close(fd)?;

    // S2: reopen and read it back.
    let fd = shim.open("/hello.txt", 0)?;
    let mut buf = [0u8; 64];
    let n = shim.read(fd, &mut buf)?;
    log::info!("S2: read back {:?}", String::from_utf8_lossy(&buf[..n]));
    shim.close(fd)?;

    // S3: nested directories and a file inside one.
    shim.mkdir("/logs")?;
    shim.mkdir("/logs/2026")?;
    let fd = shim.open("/logs/2026/jan.log", libc::O_CREAT)?;
    shim.write(fd, b"entry one\n")?;
    shim.close(fd)?;
    log::info!("S3: created /logs/2026/jan.log");

    // S4: append-mode write grows the file past its current tail.
    let fd = shim.open("/logs/2026/jan.log", libc::O_APPEND)?;
    shim.write(fd, b"entry two\n")?;
    shim.close(fd)?;
    log::info!("S4: appended a second entry");

    // S5: truncate shrinks a file in place.
    let fd = shim.open("/hello.txt", 0)?;
    shim.ftruncate(fd, 5)?;
    shim.close(fd)?;
    log::info!("S5: truncated /hello.txt to 5 bytes");

    // S6: unlink a file and rmdir an emptied directory tree.
    let fd = shim.open("/logs/2026/jan.log", 0)?;
    shim.fsync(fd)?;
    shim.close(fd)?;
    shim.unlink("/hello.txt")?;
    shim.unlink("/logs/2026/jan.log")?;
    shim.rmdir("/logs/2026")?;
    shim.rmdir("/logs")?;
    log::info!("S6: synced, then cleaned up /hello.txt and /logs");

    Ok(())
}
