//! Both ends of a diff-copy session.

use super::{PacketStream, PathFilter, StatMap, SyncedDir};
use crate::error::SyncError;
use buildlink_core::{Packet, PacketType, Stat};
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use walkdir::WalkDir;

const CHUNK_SIZE: usize = 32 * 1024;

struct Entry {
    stat: Stat,
    path: PathBuf,
}

/// Send `dir` to the peer: list it, serve content requests, then finish.
pub async fn send_dir<S>(
    dir: &SyncedDir,
    filter: &PathFilter,
    stream: &mut S,
) -> Result<(), SyncError>
where
    S: PacketStream + ?Sized,
{
    let root = dir.dir.clone();
    let walk_filter = filter.clone();
    let map = dir.map;
    let entries = tokio::task::spawn_blocking(move || list_entries(&root, &walk_filter, map))
        .await
        .map_err(io::Error::other)??;
    tracing::debug!(dir = %dir.dir.display(), entries = entries.len(), "sending directory");

    for entry in &entries {
        stream.send(Packet::stat(entry.stat.clone())).await?;
    }
    stream.send(Packet::end_of_listing()).await?;

    loop {
        let Some(packet) = stream.recv().await? else {
            return Err(SyncError::Disconnected);
        };
        match packet.kind {
            PacketType::Req => {
                let entry = entries
                    .get(packet.id as usize)
                    .filter(|entry| entry.stat.is_file());
                let Some(entry) = entry else {
                    let message = format!("invalid file request {}", packet.id);
                    stream.send(Packet::err(message.clone())).await?;
                    return Err(SyncError::Protocol(message));
                };
                send_file(&entry.path, packet.id, stream).await?;
            }
            PacketType::Fin => {
                stream.send(Packet::fin()).await?;
                return Ok(());
            }
            PacketType::Err => return Err(SyncError::Remote(packet.error_message())),
            other => return Err(SyncError::Protocol(format!("{other:?} from receiver"))),
        }
    }
}

async fn send_file<S>(path: &Path, id: u32, stream: &mut S) -> Result<(), SyncError>
where
    S: PacketStream + ?Sized,
{
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.send(Packet::data(id, buf[..n].to_vec())).await?;
    }
    stream.send(Packet::data(id, Vec::new())).await
}

fn list_entries(root: &Path, filter: &PathFilter, map: Option<StatMap>) -> io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut walk = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walk.next() {
        let entry = entry?;
        let is_dir = entry.file_type().is_dir();
        let Some(rel) = relative_slash_path(root, entry.path()) else {
            continue;
        };

        if filter.is_excluded(&rel) {
            if is_dir && !filter.has_negations() {
                walk.skip_current_dir();
            }
            continue;
        }
        if !filter.is_included(&rel) && !(is_dir && filter.may_contain_included(&rel)) {
            if is_dir {
                walk.skip_current_dir();
            }
            continue;
        }

        let meta = entry.metadata()?;
        let linkname = if entry.path_is_symlink() {
            std::fs::read_link(entry.path())?
                .to_string_lossy()
                .into_owned()
        } else {
            String::new()
        };
        let mut stat = stat_for(rel, &meta, linkname);
        if let Some(map) = map
            && !map(&mut stat)
        {
            continue;
        }
        entries.push(Entry {
            stat,
            path: entry.into_path(),
        });
    }
    Ok(entries)
}

fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[cfg(unix)]
fn stat_for(path: String, meta: &Metadata, linkname: String) -> Stat {
    use std::os::unix::fs::MetadataExt;
    Stat {
        path,
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: if meta.is_file() { meta.len() } else { 0 },
        mod_time: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
        linkname,
    }
}

#[cfg(not(unix))]
fn stat_for(path: String, meta: &Metadata, linkname: String) -> Stat {
    let mode = if meta.is_dir() {
        Stat::MODE_DIR | 0o755
    } else if meta.file_type().is_symlink() {
        Stat::MODE_SYMLINK | 0o777
    } else if meta.permissions().readonly() {
        0o100444
    } else {
        0o100644
    };
    let mod_time = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos() as i64);
    Stat {
        path,
        mode,
        uid: 0,
        gid: 0,
        size: if meta.is_file() { meta.len() } else { 0 },
        mod_time,
        linkname,
    }
}

/// Receive a directory into `dest`, returning the sender's listing.
pub async fn receive_dir<S>(dest: &Path, stream: &mut S) -> Result<Vec<Stat>, SyncError>
where
    S: PacketStream + ?Sized,
{
    let mut listing = Vec::new();
    loop {
        let packet = next_packet(stream).await?;
        match packet.kind {
            PacketType::Stat => match packet.stat {
                Some(stat) => listing.push(stat),
                None => break,
            },
            PacketType::Err => return Err(SyncError::Remote(packet.error_message())),
            other => return Err(SyncError::Protocol(format!("{other:?} during listing"))),
        }
    }

    for stat in &listing {
        let target = safe_join(dest, &stat.path)?;
        if stat.is_dir() {
            tokio::fs::create_dir_all(&target).await?;
        } else if stat.is_symlink() {
            create_parent(&target).await?;
            make_symlink(&stat.linkname, &target).await?;
        }
    }

    for (id, stat) in listing.iter().enumerate() {
        if !stat.is_file() {
            continue;
        }
        let id = id as u32;
        let target = safe_join(dest, &stat.path)?;
        create_parent(&target).await?;
        stream.send(Packet::request(id)).await?;

        let mut file = tokio::fs::File::create(&target).await?;
        loop {
            let packet = next_packet(stream).await?;
            match packet.kind {
                PacketType::Data if packet.id == id => {
                    if packet.data.is_empty() {
                        break;
                    }
                    file.write_all(&packet.data).await?;
                }
                PacketType::Err => return Err(SyncError::Remote(packet.error_message())),
                other => {
                    return Err(SyncError::Protocol(format!(
                        "{other:?} while receiving {}",
                        stat.path
                    )));
                }
            }
        }
        file.flush().await?;
        set_mode(&target, stat.permissions()).await?;
    }

    stream.send(Packet::fin()).await?;
    let packet = next_packet(stream).await?;
    match packet.kind {
        PacketType::Fin => Ok(listing),
        PacketType::Err => Err(SyncError::Remote(packet.error_message())),
        other => Err(SyncError::Protocol(format!("{other:?} instead of fin"))),
    }
}

async fn next_packet<S>(stream: &mut S) -> Result<Packet, SyncError>
where
    S: PacketStream + ?Sized,
{
    stream.recv().await?.ok_or(SyncError::Disconnected)
}

/// Join a listed path onto `dest`, refusing anything that escapes it.
fn safe_join(dest: &Path, rel: &str) -> Result<PathBuf, SyncError> {
    let rel = Path::new(rel);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || rel.as_os_str().is_empty() {
        return Err(SyncError::Protocol(format!(
            "invalid path {}",
            rel.display()
        )));
    }
    Ok(dest.join(rel))
}

async fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => tokio::fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}

#[cfg(unix)]
async fn make_symlink(linkname: &str, target: &Path) -> io::Result<()> {
    tokio::fs::symlink(linkname, target).await
}

#[cfg(not(unix))]
async fn make_symlink(linkname: &str, target: &Path) -> io::Result<()> {
    tracing::debug!(link = %target.display(), linkname, "skipping symlink");
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
