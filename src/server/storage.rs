//! Durable storage logging module: a single backing file of length-prefixed
//! MessagePack entries, owned by a dedicated logger task.

use std::fmt;
use std::io::SeekFrom;
use std::path::Path;

use crate::utils::PaxlockError;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Log action ID type.
pub type LogActionId = u64;

/// Action command to the logger. File cursor will be positioned at EOF after
/// every action.
#[derive(Debug, Serialize, Deserialize)]
pub enum LogAction<Ent> {
    /// Read a log entry out.
    Read { offset: usize },

    /// Append a log entry to EOF.
    Append { entry: Ent, sync: bool },

    /// Truncate the log at given offset, keeping the head part.
    Truncate { offset: usize },
}

/// Action result returned by the logger.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub enum LogResult<Ent> {
    /// `Some(entry)` if successful, else `None`.
    Read {
        entry: Option<Ent>,
        end_offset: usize,
    },

    /// `now_size` is the size of file after this.
    Append { now_size: usize },

    /// `offset_ok` is true if truncate successful, else false. `now_size` is
    /// the size of file after this.
    Truncate { offset_ok: bool, now_size: usize },
}

/// Durable storage logging module.
pub struct StorageHub<Ent> {
    /// Sender side of the log channel.
    tx_log: mpsc::UnboundedSender<(LogActionId, LogAction<Ent>)>,

    /// Receiver side of the ack channel. A failed action is acked with its
    /// error.
    rx_ack: mpsc::UnboundedReceiver<(
        LogActionId,
        Result<LogResult<Ent>, PaxlockError>,
    )>,

    /// Join handle of the logger thread.
    logger_handle: JoinHandle<()>,

    /// Next action ID used by `do_sync_action`.
    next_id: LogActionId,
}

// StorageHub public API implementation
impl<Ent> StorageHub<Ent>
where
    Ent: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a new durable storage logging hub. Spawns the logger thread.
    /// Prepares the given backing file as durability backend; an existing
    /// file is kept as-is so that its entries can be replayed.
    pub async fn new_and_setup(path: &Path) -> Result<Self, PaxlockError> {
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!("created backer file '{}'", path.display());
        } else {
            pf_info!("backer file '{}' already exists", path.display());
        }
        let mut backer_file =
            OpenOptions::new().read(true).write(true).open(path).await?;
        backer_file.seek(SeekFrom::End(0)).await?; // seek to EOF

        let (tx_log, rx_log) = mpsc::unbounded_channel();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();

        let logger_handle =
            tokio::spawn(Self::logger_thread(backer_file, rx_log, tx_ack));

        Ok(StorageHub {
            tx_log,
            rx_ack,
            logger_handle,
            next_id: 0,
        })
    }

    /// Submits an action by sending it to the log channel.
    pub fn submit_action(
        &mut self,
        id: LogActionId,
        action: LogAction<Ent>,
    ) -> Result<(), PaxlockError> {
        self.tx_log
            .send((id, action))
            .map_err(|e| PaxlockError(e.to_string()))
    }

    /// Waits for the next logging result by receiving from the ack channel.
    pub async fn get_result(
        &mut self,
    ) -> Result<(LogActionId, Result<LogResult<Ent>, PaxlockError>), PaxlockError>
    {
        match self.rx_ack.recv().await {
            Some((id, result)) => Ok((id, result)),
            None => logged_err!("ack channel has been closed"),
        }
    }

    /// Submits an action and waits for its result. Results of earlier
    /// asynchronously submitted actions are skipped over.
    pub async fn do_sync_action(
        &mut self,
        action: LogAction<Ent>,
    ) -> Result<LogResult<Ent>, PaxlockError> {
        let id = self.next_id;
        self.next_id += 1;
        self.submit_action(id, action)?;
        loop {
            let (ack_id, result) = self.get_result().await?;
            if ack_id == id {
                return result;
            }
        }
    }

    /// Reads out every complete entry in the log, in order. Returns the
    /// entries and the offset right after the last complete one.
    pub async fn read_all(
        &mut self,
    ) -> Result<(Vec<Ent>, usize), PaxlockError> {
        let mut entries = vec![];
        let mut offset = 0;
        loop {
            match self.do_sync_action(LogAction::Read { offset }).await? {
                LogResult::Read {
                    entry: Some(entry),
                    end_offset,
                } => {
                    entries.push(entry);
                    offset = end_offset;
                }
                LogResult::Read { entry: None, .. } => break,
                _ => return logged_err!("unexpected log result type"),
            }
        }
        Ok((entries, offset))
    }

    /// Appends an entry durably (if `sync`) and returns the file size after.
    pub async fn append(
        &mut self,
        entry: Ent,
        sync: bool,
    ) -> Result<usize, PaxlockError> {
        match self.do_sync_action(LogAction::Append { entry, sync }).await? {
            LogResult::Append { now_size } => Ok(now_size),
            _ => logged_err!("unexpected log result type"),
        }
    }

    /// Truncates the log at given offset.
    pub async fn truncate(&mut self, offset: usize) -> Result<(), PaxlockError> {
        match self.do_sync_action(LogAction::Truncate { offset }).await? {
            LogResult::Truncate {
                offset_ok: true, ..
            } => Ok(()),
            _ => logged_err!("failed to truncate log at offset {}", offset),
        }
    }
}

// StorageHub logger thread implementation
impl<Ent> StorageHub<Ent>
where
    Ent: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Read out entry at given offset.
    async fn read_entry(
        backer: &mut File,
        file_size: usize,
        offset: usize,
    ) -> Result<(Option<Ent>, usize), PaxlockError> {
        if offset + 8 > file_size {
            if offset < file_size {
                // suppress warning if offset == file_size, which is the
                // normal end of a replay
                pf_warn!(
                    "read header end offset {} out of file bound {}",
                    offset + 8,
                    file_size
                );
            }
            return Ok((None, offset));
        }

        // read entry length header
        backer.seek(SeekFrom::Start(offset as u64)).await?;
        let entry_len: usize = backer.read_u64().await? as usize;
        let offset_e = offset + 8 + entry_len;
        if offset_e > file_size {
            pf_warn!("read entry invalid length {}", entry_len);
            backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
            return Ok((None, offset));
        }

        // read entry content
        let mut entry_buf: Vec<u8> = vec![0; entry_len];
        backer.read_exact(&mut entry_buf[..]).await?;
        backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
        match decode_from_slice(&entry_buf) {
            Ok(entry) => Ok((Some(entry), offset_e)),
            Err(e) => {
                // treated like a torn tail: replay stops here
                pf_warn!("read entry at offset {} undecodable: {}", offset, e);
                Ok((None, offset))
            }
        }
    }

    /// Append given entry to EOF.
    async fn append_entry(
        backer: &mut File,
        file_size: usize,
        entry: &Ent,
        sync: bool,
    ) -> Result<usize, PaxlockError> {
        let entry_bytes = encode_to_vec(entry)?;
        let entry_len = entry_bytes.len();

        // write entry length header first, then entry content
        backer.write_u64(entry_len as u64).await?;
        backer.write_all(&entry_bytes[..]).await?;

        if sync {
            backer.sync_data().await?;
        }

        Ok(file_size + 8 + entry_len)
    }

    /// Truncate the file at given offset, keeping the head part.
    async fn truncate_log(
        backer: &mut File,
        file_size: usize,
        offset: usize,
    ) -> Result<(bool, usize), PaxlockError> {
        if offset > file_size {
            pf_warn!("truncate offset {} exceeds file end {}", offset, file_size);
            Ok((false, file_size))
        } else {
            backer.set_len(offset as u64).await?;
            backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF

            backer.sync_all().await?;
            Ok((true, offset))
        }
    }

    /// Carry out the given action on logger, updating the tracked file size.
    async fn do_action(
        backer: &mut File,
        file_size: &mut usize,
        action: LogAction<Ent>,
    ) -> Result<LogResult<Ent>, PaxlockError> {
        match action {
            LogAction::Read { offset } => {
                Self::read_entry(backer, *file_size, offset).await.map(
                    |(entry, end_offset)| LogResult::Read { entry, end_offset },
                )
            }
            LogAction::Append { entry, sync } => {
                Self::append_entry(backer, *file_size, &entry, sync)
                    .await
                    .map(|now_size| {
                        *file_size = now_size;
                        LogResult::Append { now_size }
                    })
            }
            LogAction::Truncate { offset } => {
                Self::truncate_log(backer, *file_size, offset).await.map(
                    |(offset_ok, now_size)| {
                        *file_size = now_size;
                        LogResult::Truncate {
                            offset_ok,
                            now_size,
                        }
                    },
                )
            }
        }
    }

    /// Logger thread function.
    async fn logger_thread(
        mut backer_file: File,
        mut rx_log: mpsc::UnboundedReceiver<(LogActionId, LogAction<Ent>)>,
        tx_ack: mpsc::UnboundedSender<(
            LogActionId,
            Result<LogResult<Ent>, PaxlockError>,
        )>,
    ) {
        pf_debug!("logger thread spawned");

        // maintain file size
        let mut file_size: usize = match backer_file.metadata().await {
            Ok(metadata) => metadata.len() as usize,
            Err(e) => {
                pf_error!("error reading backer file metadata: {}, exiting", e);
                return;
            }
        };

        while let Some((id, action)) = rx_log.recv().await {
            let result =
                Self::do_action(&mut backer_file, &mut file_size, action).await;
            if let Err(ref e) = result {
                pf_error!("error during logging: {}", e);
            }
            if let Err(e) = tx_ack.send((id, result)) {
                pf_error!("error sending to tx_ack: {}", e);
            }
        }

        // channel gets closed and no messages remain
        pf_debug!("logger thread exited");
    }
}

impl<Ent> Drop for StorageHub<Ent> {
    fn drop(&mut self) {
        self.logger_handle.abort();
    }
}
