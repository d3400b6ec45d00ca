// src/main.rs

use anyhow::{Context, Result};
use fuser::MountOption;
use nestfs::{LibraryFs, LibraryIndex, LibraryStore};
use std::env;
use std::io::BufRead;
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => mount_discovered(),
        2 | 3 => {
            let library = PathBuf::from(&args[1]);
            let target = args
                .get(2)
                .map(PathBuf::from)
                .unwrap_or_else(|| default_target(&library));
            mount_foreground(&library, &target)
        }
        _ => {
            eprintln!("Usage: {} [library_dir [mountpoint]]", args[0]);
            Ok(())
        }
    }
}

/// Mountpoint for a library: a sibling directory named after its stem
/// (`test.library` mounts at `test`).
fn default_target(library: &Path) -> PathBuf {
    let stem = library
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "library".to_string());
    library.with_file_name(stem)
}

fn open_fs(library: &Path) -> Result<LibraryFs> {
    let index = LibraryIndex::open(LibraryStore::new(library), nestfs::now_ms())
        .with_context(|| format!("failed to index library {}", library.display()))?;
    Ok(LibraryFs::new(index))
}

fn mount_options() -> Vec<MountOption> {
    vec![
        MountOption::FSName("nestfs".to_string()),
        MountOption::AutoUnmount,
    ]
}

fn mount_foreground(library: &Path, target: &Path) -> Result<()> {
    if target == library {
        anyhow::bail!(
            "mountpoint {} would shadow the library itself; pass an explicit mountpoint",
            target.display()
        );
    }
    tracing::info!("mounting {} at {}", library.display(), target.display());
    std::fs::create_dir_all(target)
        .with_context(|| format!("cannot create mountpoint {}", target.display()))?;
    let fs = open_fs(library)?;
    fuser::mount2(fs, target, &mount_options())
        .with_context(|| format!("mount failed at {}", target.display()))?;
    Ok(())
}

/// No arguments: mount every `*.library` directory in the current directory,
/// each at a sibling directory named after its stem, until Enter is pressed.
fn mount_discovered() -> Result<()> {
    let cwd = env::current_dir()?;
    let mut sessions = Vec::new();
    for entry in std::fs::read_dir(&cwd)? {
        let path = entry?.path();
        if !path.is_dir() || path.extension().map_or(true, |e| e != "library") {
            continue;
        }
        let target = default_target(&path);
        tracing::info!("mounting {} at {}", path.display(), target.display());
        std::fs::create_dir_all(&target)
            .with_context(|| format!("cannot create mountpoint {}", target.display()))?;
        let fs = open_fs(&path)?;
        let session = fuser::spawn_mount2(fs, &target, &mount_options())
            .with_context(|| format!("mount failed at {}", target.display()))?;
        sessions.push(session);
    }

    if sessions.is_empty() {
        eprintln!("No *.library directories found in {}", cwd.display());
        return Ok(());
    }

    println!("{} library(s) mounted. Press Enter to unmount and exit.", sessions.len());
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);

    drop(sessions);
    tracing::info!("nestfs shutting down");
    Ok(())
}
