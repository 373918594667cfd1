//! Device filesystem operations
//!
//! Every operation here is a thin code generator over [`Session::exec`]:
//! it pushes a small interpreter snippet at the device and parses what
//! the snippet prints. Bulk transfers are chunked, so one logical copy
//! becomes N execute round-trips, each individually subject to the
//! session's timeout and terminator rules.

use crate::error::{ProtocolError, Result};
use crate::pyliteral::{self, Value};
use crate::session::{DataConsumer, Session, trim_ascii};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Default transfer chunk size for reads, writes and copies.
pub const DEFAULT_CHUNK: usize = 256;
/// Default chunk size for uploads; smaller because each chunk is a
/// full source-literal round trip.
pub const DEFAULT_PUT_CHUNK: usize = 64;

/// Pacing delay between upload chunks.
const PUT_PACING: Duration = Duration::from_millis(50);

/// One directory entry as reported by `uos.ilistdir`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Mode bits (0x4000 set for directories)
    pub mode: u32,
    /// Inode number (0 where the filesystem has none)
    pub inode: u64,
    /// Size in bytes (0 for directories and three-field results)
    pub size: u64,
}

impl DirEntry {
    /// Whether the mode bits mark this entry as a directory
    pub fn is_dir(&self) -> bool {
        self.mode & 0x4000 != 0
    }
}

/// Result of `uos.stat`, field-for-field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// Mode bits
    pub mode: u32,
    /// Inode number
    pub inode: u64,
    /// Device id
    pub device: u64,
    /// Link count
    pub nlink: u64,
    /// Owner uid
    pub uid: u32,
    /// Owner gid
    pub gid: u32,
    /// Size in bytes
    pub size: u64,
    /// Access time
    pub atime: i64,
    /// Modification time
    pub mtime: i64,
    /// Creation time
    pub ctime: i64,
}

/// Per-chunk progress callback: (bytes done, total bytes).
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Quote a device path for inclusion in a generated snippet.
fn quoted(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 2);
    out.push('\'');
    for c in path.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// `uos.ilistdir` accepts no argument for the current directory.
fn quoted_or_empty(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        quoted(path)
    }
}

/// Degrade a "does not exist" remote traceback into `NotFound` so
/// lookups stay non-fatal to the caller's control flow.
fn map_not_found(err: ProtocolError, path: &str) -> ProtocolError {
    if err.is_not_found() {
        ProtocolError::NotFound(path.to_string())
    } else {
        err
    }
}

fn parse_listdir_output(out: &[u8]) -> Result<Vec<DirEntry>> {
    // ilistdir prints one repr per entry with a trailing comma; wrap in
    // brackets to get one parseable list.
    let text = format!("[{}]", String::from_utf8_lossy(out));
    let parsed = pyliteral::parse(text.trim())?;
    let mut entries = Vec::new();
    for item in parsed.as_seq().unwrap_or_default() {
        if let Some(entry) = entry_from_value(item) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Entries come as 3-tuples (name, mode, inode) or 4-tuples with size.
fn entry_from_value(value: &Value) -> Option<DirEntry> {
    let fields = value.as_seq()?;
    if fields.len() < 3 {
        return None;
    }
    Some(DirEntry {
        name: fields[0].as_str()?.to_string(),
        mode: fields[1].as_int()? as u32,
        inode: fields[2].as_int()? as u64,
        size: fields.get(3).and_then(Value::as_int).unwrap_or(0) as u64,
    })
}

fn stat_from_value(value: &Value) -> Option<FileStat> {
    let fields = value.as_seq()?;
    if fields.len() != 10 {
        return None;
    }
    let int = |i: usize| fields[i].as_int();
    Some(FileStat {
        mode: int(0)? as u32,
        inode: int(1)? as u64,
        device: int(2)? as u64,
        nlink: int(3)? as u64,
        uid: int(4)? as u32,
        gid: int(5)? as u32,
        size: int(6)? as u64,
        atime: int(7)?,
        mtime: int(8)?,
        ctime: int(9)?,
    })
}

impl Session<'_> {
    /// Print the device's current working directory.
    pub async fn fs_pwd(&mut self) -> Result<String> {
        let out = self.exec_strict(b"import os\nprint(os.getcwd())\n").await?;
        Ok(String::from_utf8_lossy(trim_ascii(&out)).to_string())
    }

    /// Change the device's current working directory.
    pub async fn fs_chdir(&mut self, path: &str) -> Result<()> {
        let cmd = format!("import uos\nuos.chdir({})", quoted(path));
        self.exec_strict(cmd.as_bytes())
            .await
            .map_err(|e| map_not_found(e, path))?;
        Ok(())
    }

    /// Human-readable directory listing (size-and-name lines, trailing
    /// slash on directories), streamed to `consumer` if given.
    pub async fn fs_ls(
        &mut self,
        path: &str,
        consumer: Option<DataConsumer<'_>>,
    ) -> Result<Vec<u8>> {
        let cmd = format!(
            "import uos\nfor f in uos.ilistdir({}):\n print('{{:12}} {{}}{{}}'.format(f[3]if len(f)>3 else 0,f[0],'/'if f[1]&0x4000 else ''))",
            quoted_or_empty(path)
        );
        let output = self.exec(cmd.as_bytes(), consumer).await?;
        output.into_result().map_err(|e| map_not_found(e, path))
    }

    /// Structured directory listing.
    pub async fn fs_listdir(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let cmd = format!(
            "import uos\nfor f in uos.ilistdir({}):\n print(repr(f), end=',')",
            quoted_or_empty(path)
        );
        let out = self
            .exec_strict(cmd.as_bytes())
            .await
            .map_err(|e| map_not_found(e, path))?;
        parse_listdir_output(&out)
    }

    /// Stat a path.
    pub async fn fs_stat(&mut self, path: &str) -> Result<FileStat> {
        self.exec_strict(b"import uos").await?;
        let value = self
            .eval_parsed(&format!("uos.stat({})", quoted(path)))
            .await
            .map_err(|e| map_not_found(e, path))?;
        stat_from_value(&value)
            .ok_or_else(|| ProtocolError::NotFound(path.to_string()))
    }

    /// Whether a path exists. Lookup failures are an answer here, not
    /// an error.
    pub async fn fs_exists(&mut self, path: &str) -> Result<bool> {
        let cmd = format!("import uos\nuos.stat({})", quoted(path));
        match self.exec_raw(cmd.as_bytes(), None).await?.into_result() {
            Ok(_) => Ok(true),
            Err(ProtocolError::Remote { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read a text file chunk-by-chunk, streaming to `consumer`.
    pub async fn fs_cat(
        &mut self,
        path: &str,
        chunk_size: usize,
        consumer: Option<DataConsumer<'_>>,
    ) -> Result<Vec<u8>> {
        let cmd = format!(
            "with open({}) as f:\n while 1:\n  b=f.read({chunk_size})\n  if not b:break\n  print(b,end='')",
            quoted(path)
        );
        let output = self.exec(cmd.as_bytes(), consumer).await?;
        output.into_result().map_err(|e| map_not_found(e, path))
    }

    /// Read a file's exact byte contents.
    pub async fn fs_readfile(&mut self, path: &str, chunk_size: usize) -> Result<Vec<u8>> {
        let cmd = format!(
            "with open({}, 'rb') as f:\n while 1:\n  b=f.read({chunk_size})\n  if not b:break\n  print(b,end='')",
            quoted(path)
        );
        let out = self
            .exec_strict(cmd.as_bytes())
            .await
            .map_err(|e| map_not_found(e, path))?;
        let text = String::from_utf8_lossy(&out);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        match pyliteral::parse(trimmed)? {
            Value::Bytes(data) => Ok(data),
            _ => Err(ProtocolError::Parse(
                pyliteral::LiteralError::Unexpected('?', 0),
            )),
        }
    }

    /// Write exact byte contents to a device file.
    pub async fn fs_writefile(
        &mut self,
        path: &str,
        data: &[u8],
        chunk_size: usize,
    ) -> Result<()> {
        let open = format!("f=open({},'wb')\nw=f.write", quoted(path));
        self.exec_strict(open.as_bytes()).await?;
        for chunk in data.chunks(chunk_size.max(1)) {
            let cmd = format!("w({})", pyliteral::format_bytes(chunk));
            self.exec_strict(cmd.as_bytes()).await?;
        }
        self.exec_strict(b"f.close()").await?;
        Ok(())
    }

    /// Copy a file on the device, streaming through the device's own
    /// read/write calls chunk by chunk.
    pub async fn fs_cp(
        &mut self,
        src: &str,
        dst: &str,
        chunk_size: usize,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        let total = match progress {
            Some(_) => self.fs_stat(src).await?.size,
            None => 0,
        };
        let open = format!(
            "fr=open({},'rb')\nr=fr.read\nfw=open({},'wb')\nw=fw.write",
            quoted(src),
            quoted(dst)
        );
        self.exec_strict(open.as_bytes())
            .await
            .map_err(|e| map_not_found(e, src))?;
        let step = format!("d=r({chunk_size})\nw(d)\nprint(len(d))");
        let mut written = 0u64;
        loop {
            let out = self.exec_strict(step.as_bytes()).await?;
            let text = String::from_utf8_lossy(&out);
            let n = pyliteral::parse(text.trim())?
                .as_int()
                .unwrap_or(0) as u64;
            if n == 0 {
                break;
            }
            written += n;
            if let Some(progress) = progress {
                progress(written, total);
            }
        }
        self.exec_strict(b"fr.close()\nfw.close()").await?;
        Ok(())
    }

    /// Download a device file into a local file.
    pub async fn fs_get(
        &mut self,
        src: &str,
        dst: &Path,
        chunk_size: usize,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        let total = match progress {
            Some(_) => self.fs_stat(src).await?.size,
            None => 0,
        };
        let open = format!("f=open({},'rb')\nr=f.read", quoted(src));
        self.exec_strict(open.as_bytes())
            .await
            .map_err(|e| map_not_found(e, src))?;

        let mut local = tokio::fs::File::create(dst)
            .await
            .map_err(replink_transport::TransportError::from)?;
        let step = format!("print(r({chunk_size}))");
        let mut written = 0u64;
        loop {
            let out = self.exec_strict(step.as_bytes()).await?;
            let text = String::from_utf8_lossy(&out);
            let chunk = match pyliteral::parse(text.trim())? {
                Value::Bytes(data) => data,
                _ => {
                    return Err(ProtocolError::Parse(
                        pyliteral::LiteralError::Unexpected('?', 0),
                    ));
                }
            };
            if chunk.is_empty() {
                break;
            }
            local
                .write_all(&chunk)
                .await
                .map_err(replink_transport::TransportError::from)?;
            written += chunk.len() as u64;
            if let Some(progress) = progress {
                progress(written, total);
            }
        }
        self.exec_strict(b"f.close()").await?;
        Ok(())
    }

    /// Upload a local file to the device.
    pub async fn fs_put(
        &mut self,
        src: &Path,
        dst: &str,
        chunk_size: usize,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        debug!("putting file {} as {dst}", src.display());
        let data = tokio::fs::read(src)
            .await
            .map_err(replink_transport::TransportError::from)?;
        let total = data.len() as u64;

        let open = format!("f=open({},'wb')\nw=f.write", quoted(dst));
        self.exec_strict(open.as_bytes()).await?;
        let mut written = 0u64;
        for chunk in data.chunks(chunk_size.max(1)) {
            let cmd = format!("w({})", pyliteral::format_bytes(chunk));
            self.exec_strict(cmd.as_bytes()).await?;
            written += chunk.len() as u64;
            if let Some(progress) = progress {
                progress(written, total);
            }
            tokio::time::sleep(PUT_PACING).await;
        }
        self.exec_strict(b"f.close()").await?;
        Ok(())
    }

    /// Create a directory.
    pub async fn fs_mkdir(&mut self, path: &str) -> Result<()> {
        let cmd = format!("import uos\nuos.mkdir({})", quoted(path));
        self.exec_strict(cmd.as_bytes())
            .await
            .map_err(|e| map_not_found(e, path))?;
        Ok(())
    }

    /// Remove an empty directory.
    pub async fn fs_rmdir(&mut self, path: &str) -> Result<()> {
        let cmd = format!("import uos\nuos.rmdir({})", quoted(path));
        self.exec_strict(cmd.as_bytes())
            .await
            .map_err(|e| map_not_found(e, path))?;
        Ok(())
    }

    /// Remove a file.
    pub async fn fs_rm(&mut self, path: &str) -> Result<()> {
        let cmd = format!("import uos\nuos.remove({})", quoted(path));
        self.exec_strict(cmd.as_bytes())
            .await
            .map_err(|e| map_not_found(e, path))?;
        Ok(())
    }

    /// Create an empty file or update an existing one.
    pub async fn fs_touch(&mut self, path: &str) -> Result<()> {
        let cmd = format!("f=open({},'a')\nf.close()", quoted(path));
        self.exec_strict(cmd.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_escaping() {
        assert_eq!(quoted("main.py"), "'main.py'");
        assert_eq!(quoted("it's"), r"'it\'s'");
        assert_eq!(quoted(r"a\b"), r"'a\\b'");
        assert_eq!(quoted_or_empty(""), "");
        assert_eq!(quoted_or_empty("lib"), "'lib'");
    }

    #[test]
    fn test_parse_listdir_output() {
        let out = b"('boot.py', 32768, 0, 119),('lib', 16384, 0),";
        let entries = parse_listdir_output(out).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "boot.py");
        assert_eq!(entries[0].size, 119);
        assert!(!entries[0].is_dir());
        // Three-field results default size to 0.
        assert_eq!(entries[1].size, 0);
        assert!(entries[1].is_dir());
    }

    #[test]
    fn test_parse_listdir_empty() {
        assert!(parse_listdir_output(b"").unwrap().is_empty());
    }

    #[test]
    fn test_stat_from_value() {
        let value =
            pyliteral::parse("(32768, 5, 0, 1, 0, 0, 119, 10, 20, 30)").unwrap();
        let stat = stat_from_value(&value).unwrap();
        assert_eq!(stat.mode, 32768);
        assert_eq!(stat.inode, 5);
        assert_eq!(stat.size, 119);
        assert_eq!(stat.ctime, 30);

        let short = pyliteral::parse("(1, 2, 3)").unwrap();
        assert!(stat_from_value(&short).is_none());
    }
}
