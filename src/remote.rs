// Cumulus backup system.
// Copyright 2008 The Cumulus Developers.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Transfer of finished files to the remote server.
//!
//! Files are staged locally, then handed to a single background worker
//! that either drives an external upload script (one `PUT` line per file,
//! expecting `OK` back) or, when backing up straight to a local directory,
//! simply leaves the staged file in place. The queue between the backup
//! thread and the worker is bounded, so a slow upload throttles the backup
//! rather than filling the staging area.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::errors::Error;
use crate::format::uri_encode;
use crate::Result;

/// Maximum number of files queued for upload before `send` blocks.
const MAX_QUEUE_SIZE: usize = 4;

enum Job {
    Transfer {
        file_type: String,
        remote_path: String,
        local_path: PathBuf,
    },
    Barrier(mpsc::Sender<()>),
}

struct Shared {
    /// Files allocated but not yet queued; must be zero at shutdown.
    files_outstanding: AtomicUsize,
    /// First fatal upload error, if any; checked by `sync`.
    error: Mutex<Option<String>>,
}

impl Shared {
    fn record_error(&self, message: String) {
        let mut error = self.error.lock().unwrap();
        if error.is_none() {
            *error = Some(message);
        }
    }
}

/// Owner of the transfer queue and the background upload worker.
pub struct RemoteStore {
    tx: Option<SyncSender<Job>>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    staging_dir: PathBuf,
}

impl RemoteStore {
    /// Create a store staging files under `staging_dir`.
    ///
    /// With `upload_script`, staged files are transferred by the script
    /// and deleted locally on success. Without one, `staging_dir` is the
    /// backup destination itself and files stay where they are written.
    pub fn new(staging_dir: &Path, upload_script: Option<String>) -> RemoteStore {
        let shared = Arc::new(Shared {
            files_outstanding: AtomicUsize::new(0),
            error: Mutex::new(None),
        });
        let (tx, rx) = mpsc::sync_channel(MAX_QUEUE_SIZE);
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("cumulus-upload".to_owned())
            .spawn(move || transfer_worker(rx, upload_script, worker_shared))
            .expect("spawn upload worker");
        RemoteStore {
            tx: Some(tx),
            worker: Some(worker),
            shared,
            staging_dir: staging_dir.to_owned(),
        }
    }

    /// Reserve a staging path for a new file of the given type.
    ///
    /// The caller writes the file (see [RemoteFile::create]) and then calls
    /// [RemoteFile::send] to queue the upload.
    pub fn alloc_file(&self, name: &str, file_type: &str) -> Result<RemoteFile> {
        let subdir = self.staging_dir.join(file_type);
        fs::create_dir_all(&subdir).map_err(|source| Error::StagingFile {
            path: subdir.clone(),
            source,
        })?;
        self.shared.files_outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteFile {
            tx: self.tx.as_ref().expect("store is live").clone(),
            shared: Arc::clone(&self.shared),
            file_type: file_type.to_owned(),
            remote_path: format!("{file_type}/{name}"),
            local_path: subdir.join(name),
        })
    }

    /// Block until every queued file has been handled and the worker is
    /// idle, then report any upload failure.
    pub fn sync(&self) -> Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.tx
            .as_ref()
            .expect("store is live")
            .send(Job::Barrier(done_tx))
            .map_err(|_| Error::UploadScript {
                message: "upload worker exited unexpectedly".to_owned(),
            })?;
        let _ = done_rx.recv();
        if let Some(message) = self.shared.error.lock().unwrap().clone() {
            return Err(Error::UploadScript { message });
        }
        Ok(())
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        // On a clean shutdown every allocated file has been sent. A fatal
        // error mid-run can tear down open segments that never got that
        // far, so this is not an assertion.
        let outstanding = self.shared.files_outstanding.load(Ordering::SeqCst);
        if outstanding != 0 {
            warn!("{outstanding} staged files were allocated but never sent");
        }
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("upload worker panicked");
            }
        }
    }
}

/// A file being produced for the remote server.
///
/// Holds a reserved staging path; once written, `send` transfers ownership
/// to the upload worker.
pub struct RemoteFile {
    tx: SyncSender<Job>,
    shared: Arc<Shared>,
    file_type: String,
    remote_path: String,
    local_path: PathBuf,
}

impl RemoteFile {
    /// Create and open the staging file for writing.
    ///
    /// The returned handle must be closed (dropped) before [RemoteFile::send].
    pub fn create(&self) -> Result<File> {
        File::create(&self.local_path).map_err(|source| Error::StagingFile {
            path: self.local_path.clone(),
            source,
        })
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Path of the file on the server, relative to the store root.
    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    /// Queue the finished file for transfer. Blocks while the queue is
    /// full.
    pub fn send(self) -> Result<()> {
        self.shared.files_outstanding.fetch_sub(1, Ordering::SeqCst);
        self.tx
            .send(Job::Transfer {
                file_type: self.file_type.clone(),
                remote_path: self.remote_path.clone(),
                local_path: self.local_path.clone(),
            })
            .map_err(|_| Error::UploadScript {
                message: "upload worker exited unexpectedly".to_owned(),
            })
    }
}

struct UploadChild {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

fn spawn_upload_script(script: &str) -> std::result::Result<UploadChild, String> {
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|err| format!("cannot launch upload script: {err}"))?;
    let stdin = child.stdin.take().expect("upload child stdin is piped");
    let stdout = BufReader::new(child.stdout.take().expect("upload child stdout is piped"));
    Ok(UploadChild {
        child,
        stdin,
        stdout,
    })
}

fn transfer_worker(rx: Receiver<Job>, upload_script: Option<String>, shared: Arc<Shared>) {
    let mut upload = match upload_script.as_deref() {
        Some(script) => match spawn_upload_script(script) {
            Ok(child) => Some(child),
            Err(message) => {
                shared.record_error(message);
                None
            }
        },
        None => None,
    };

    for job in rx {
        match job {
            Job::Barrier(done) => {
                let _ = done.send(());
            }
            Job::Transfer {
                file_type,
                remote_path,
                local_path,
            } => {
                if shared.error.lock().unwrap().is_some() {
                    continue;
                }
                let Some(child) = upload.as_mut() else {
                    // Direct local storage: the staged file already sits at
                    // its final path.
                    continue;
                };
                match transfer_one(child, &file_type, &remote_path, &local_path) {
                    Ok(()) => {
                        if let Err(err) = fs::remove_file(&local_path) {
                            warn!(?local_path, "cannot delete staged file: {err}");
                        }
                    }
                    Err(message) => shared.record_error(message),
                }
            }
        }
    }

    if let Some(UploadChild {
        mut child,
        stdin,
        stdout,
    }) = upload
    {
        drop(stdin);
        drop(stdout);
        match child.wait() {
            Ok(status) if !status.success() => {
                warn!("upload script exited with status {status}");
            }
            Ok(_) => {}
            Err(err) => warn!("cannot wait for upload script: {err}"),
        }
    }
}

fn transfer_one(
    child: &mut UploadChild,
    file_type: &str,
    remote_path: &str,
    local_path: &Path,
) -> std::result::Result<(), String> {
    use std::os::unix::ffi::OsStrExt;

    let command = format!(
        "PUT {} {} {}\n",
        uri_encode(file_type.as_bytes()),
        uri_encode(remote_path.as_bytes()),
        uri_encode(local_path.as_os_str().as_bytes()),
    );
    child
        .stdin
        .write_all(command.as_bytes())
        .and_then(|()| child.stdin.flush())
        .map_err(|err| format!("error sending command to upload script: {err}"))?;

    let mut response = String::new();
    child
        .stdout
        .read_line(&mut response)
        .map_err(|err| format!("error reading response from upload script: {err}"))?;
    if response.trim_end_matches('\n') != "OK" {
        return Err(format!(
            "upload script returned {:?} for {remote_path}",
            response.trim_end_matches('\n')
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn direct_mode_leaves_files_in_place() {
        let dest = TempDir::new().unwrap();
        let store = RemoteStore::new(dest.path(), None);
        let rf = store.alloc_file("hello.txt", "meta").unwrap();
        {
            let mut f = rf.create().unwrap();
            f.write_all(b"contents").unwrap();
        }
        let path = rf.local_path().to_owned();
        rf.send().unwrap();
        store.sync().unwrap();
        assert_eq!(path, dest.path().join("meta/hello.txt"));
        assert_eq!(fs::read(&path).unwrap(), b"contents");
    }

    #[test]
    fn upload_script_receives_put_lines() {
        let dest = TempDir::new().unwrap();
        let log = dest.path().join("log");
        let script = format!(
            "while read line; do echo \"$line\" >> {}; echo OK; done",
            log.display()
        );
        let store = RemoteStore::new(dest.path(), Some(script));
        let rf = store.alloc_file("a.tar", "segments").unwrap();
        {
            let mut f = rf.create().unwrap();
            f.write_all(b"segment data").unwrap();
        }
        let staged = rf.local_path().to_owned();
        rf.send().unwrap();
        store.sync().unwrap();

        // After OK the staged copy is deleted.
        assert!(!staged.exists());
        let log_data = fs::read_to_string(&log).unwrap();
        assert!(log_data.starts_with("PUT segments segments/a.tar "));
        drop(store);
    }

    #[test]
    fn non_ok_response_is_fatal() {
        let dest = TempDir::new().unwrap();
        let store = RemoteStore::new(dest.path(), Some("while read line; do echo NO; done".into()));
        let rf = store.alloc_file("a.tar", "segments").unwrap();
        drop(rf.create().unwrap());
        rf.send().unwrap();
        match store.sync() {
            Err(Error::UploadScript { message }) => {
                assert!(message.contains("NO"), "unexpected message: {message}")
            }
            other => panic!("expected UploadScript error, got {other:?}"),
        }
    }

    #[test]
    fn sync_waits_for_queue() {
        let dest = TempDir::new().unwrap();
        let done = dest.path().join("done");
        // The script sleeps briefly so the queue actually backs up.
        let script = format!(
            "while read line; do sleep 0.05; touch {}; echo OK; done",
            done.display()
        );
        let store = RemoteStore::new(dest.path(), Some(script));
        for i in 0..3 {
            let rf = store.alloc_file(&format!("f{i}"), "segments").unwrap();
            drop(rf.create().unwrap());
            rf.send().unwrap();
        }
        store.sync().unwrap();
        assert!(done.exists());
    }
}
