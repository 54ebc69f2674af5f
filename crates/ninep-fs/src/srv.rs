//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000/9P2000.u

use {
    crate::{
        error::{self, errno::*},
        fcall::*,
        io_err, serialize,
        utils::{self, Result},
    },
    async_trait::async_trait,
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{error, info},
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{Arc, atomic::Ordering},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::{Mutex, RwLock},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::length_delimited::LengthDelimitedCodec,
};

/// Represents a fid of clients holding associated `Filesystem::FId`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FId<T> {
    /// Raw client side fid.
    fid: u32,

    /// `Filesystem::FId` associated with this fid.
    /// Changing this value affects the continuous callbacks.
    pub aux: T,
}

impl<T> FId<T> {
    /// Builds an `FId` directly, for tests driving a `Filesystem` impl
    /// without going through the wire dispatcher.
    pub fn new(fid: u32, aux: T) -> Self {
        FId { fid, aux }
    }

    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }
}

#[async_trait]
/// Filesystem server trait for implementing 9P2000/9P2000.u servers.
///
/// Implementors can represent an error condition by returning an `Err`.
/// Otherwise, they must return the appropriate `FCall` response with required fields.
///
/// # Error Handling
/// All methods should return `Err(error::Error::No(errno))` to send an error to the client.
/// Common errno values include:
/// - `ENOENT` - File not found
/// - `EACCES` - Permission denied
/// - `EISDIR` - Is a directory (when file expected)
/// - `ENOTDIR` - Not a directory (when directory expected)
///
/// # Example
/// ```no_run
/// use std::path::PathBuf;
///
/// use ninep_fs::{error, srv::{Filesystem, FId}, fcall::FCall};
/// use async_trait::async_trait;
///
/// struct MyFs;
/// type Result<T> = ::std::result::Result<T, error::Error>;
///
/// #[async_trait]
/// impl Filesystem for MyFs {
///     type FId = PathBuf;
///
///     async fn rattach(&self,
///                      fid: &FId<Self::FId>,
///                      afid: Option<&FId<Self::FId>>,
///                      uname: &str,
///                      aname: &str,
///                      n_uname: u32,
/// ) -> Result<FCall> {
///         todo!("implementation")
///     }
/// }
/// ```
/// The main trait for implementing a 9P filesystem server.
///
/// This trait provides methods corresponding to 9P protocol operations. Most methods
/// have default implementations that return `EOPNOTSUPP`, allowing you to implement
/// only the operations your filesystem needs to support.
///
/// # Minimum Implementation
///
/// For a basic read-only filesystem, you typically need to implement:
/// - [`rattach`](Self::rattach) - Attach to the filesystem root
/// - [`rwalk`](Self::rwalk) - Navigate the directory tree
/// - [`ropen`](Self::ropen) - Open files and directories
/// - [`rread`](Self::rread) - Read file contents or packed directory entries
/// - [`rstat`](Self::rstat) - Get file metadata
/// - [`rclunk`](Self::rclunk) - Close files
///
/// For a writable filesystem, additionally implement:
/// - [`rwrite`](Self::rwrite) - Write to files
/// - [`rcreate`](Self::rcreate) - Create files and directories
/// - [`rwstat`](Self::rwstat) - Modify file attributes
/// - [`rremove`](Self::rremove) - Remove files and directories
///
/// # FId Management
///
/// The `FId` type represents a file identifier that tracks open files. Each fid
/// can store custom state via the associated `FId` type. Fids are created during
/// `rattach` and `rwalk`, and must be cleaned up in `rclunk`.
pub trait Filesystem: Send {
    /// User defined fid type to be associated with a client's fid.
    ///
    /// This type stores per-fid state such as the current path, open file handle,
    /// or any other metadata needed to service requests on this fid.
    type FId: Send + Sync + Default;

    /// Authenticate a user (9P2000.u).
    ///
    /// Initiates authentication for a user. The fid will be used for authentication
    /// data exchange. Most filesystems return EOPNOTSUPP if they don't require
    /// authentication.
    ///
    /// # Arguments
    /// * `afid` - The authentication fid to use
    /// * `uname` - The user name
    /// * `aname` - The file tree to access
    /// * `n_uname` - Numeric user ID
    ///
    /// # Returns
    /// `FCall::RAuth` containing an authentication qid, or an error.
    async fn rauth(
        &self,
        _: &FId<Self::FId>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Attach to the filesystem root (9P2000.u).
    ///
    /// This is the first operation performed by a client to connect to the filesystem.
    /// It associates the fid with the root of the filesystem (or a subtree specified
    /// by `aname`). This is a core operation that must be implemented.
    ///
    /// # Arguments
    /// * `fid` - The fid to associate with the filesystem root
    /// * `afid` - Optional authentication fid (if authentication was performed)
    /// * `uname` - The user name
    /// * `aname` - The file tree to access (often "/" or empty)
    /// * `n_uname` - Numeric user ID
    ///
    /// # Returns
    /// `FCall::RAttach` containing the root qid, or an error.
    async fn rattach(
        &self,
        _: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Abort a pending operation.
    ///
    /// Requests that the server abandon a pending operation. This is typically used
    /// to cancel long-running requests.
    ///
    /// # Arguments
    /// * `old` - The original request to cancel (if still pending)
    ///
    /// # Returns
    /// `FCall::RFlush` on success, or an error.
    ///
    /// The default is a no-op success: flush is advisory at this layer, the
    /// session layer is responsible for abandoning late replies.
    async fn rflush(&self, _old: Option<&FCall>) -> Result<FCall> {
        Ok(FCall::RFlush)
    }

    /// Walk the directory tree.
    ///
    /// Traverses the directory tree from the given fid by following a sequence of
    /// path components. Creates a new fid representing the final destination.
    /// This is a core operation that must be implemented for navigation.
    ///
    /// # Arguments
    /// * `fid` - The starting fid to walk from
    /// * `newfid` - The new fid that will represent the destination
    /// * `wnames` - Array of path component names to traverse
    ///
    /// # Returns
    /// `FCall::RWalk` containing qids for each traversed component, or an error.
    async fn rwalk(
        &self,
        _: &FId<Self::FId>,
        _new: &FId<Self::FId>,
        _wnames: &[String],
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Open a file or directory.
    ///
    /// Opens the file represented by the fid with the specified 9P open mode
    /// (`om::READ`, `om::WRITE`, `om::RDWR`, `om::EXEC`, optionally or'd with
    /// `om::TRUNC`). This is one of the core operations that must be
    /// implemented for a functional filesystem.
    ///
    /// # Arguments
    /// * `fid` - The file identifier to open
    /// * `mode` - Open mode, see the `om` module
    ///
    /// # Returns
    /// `FCall::ROpen` containing a qid and iounit, or an error.
    async fn ropen(&self, _: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Create a new file or directory.
    ///
    /// Creates a new file with the given name in the directory represented by the
    /// fid, then opens it with `mode`. After creation, the fid represents the
    /// newly created file. Setting `dm::DIR` in `perm` creates a directory.
    ///
    /// # Arguments
    /// * `fid` - The directory fid where the file should be created
    /// * `name` - The name of the file to create
    /// * `perm` - Permissions and type bits for the new file, see the `dm` module
    /// * `mode` - Open mode for the new file, see the `om` module
    ///
    /// # Returns
    /// `FCall::RCreate` containing a qid and iounit, or an error.
    async fn rcreate(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _perm: u32,
        _mode: u8,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Read data from a file, or packed directory entries from a directory.
    ///
    /// Reads data from the file represented by the fid at the specified offset.
    /// When the fid represents a directory, returns a sequence of machine-independent
    /// directory entries packed into the reply, stat-sized record by stat-sized
    /// record, stopping before any entry that would overflow `count`.
    ///
    /// # Arguments
    /// * `fid` - The file fid to read from
    /// * `offset` - The byte offset to start reading from
    /// * `count` - Maximum number of bytes to read
    ///
    /// # Returns
    /// `FCall::RRead` containing the read data, or an error.
    async fn rread(&self, _: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Write data to a file.
    ///
    /// Writes data to the file represented by the fid at the specified offset.
    /// Required for writable filesystems.
    ///
    /// # Arguments
    /// * `fid` - The file fid to write to
    /// * `offset` - The byte offset to start writing at
    /// * `data` - The data to write
    ///
    /// # Returns
    /// `FCall::RWrite` containing the number of bytes written, or an error.
    async fn rwrite(&self, _: &FId<Self::FId>, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Close a fid and release resources.
    ///
    /// Informs the server that the fid is no longer needed. The server should release
    /// any resources associated with the fid. This is a core operation that must be
    /// implemented for proper resource cleanup.
    ///
    /// # Arguments
    /// * `fid` - The fid to close
    ///
    /// # Returns
    /// `FCall::RClunk` on success, or an error.
    async fn rclunk(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Remove a file or directory and clunk the fid.
    ///
    /// Removes the file represented by the fid from the filesystem, then clunks
    /// the fid whether or not the remove succeeded.
    ///
    /// # Arguments
    /// * `fid` - The file fid to remove
    ///
    /// # Returns
    /// `FCall::RRemove` on success, or an error.
    async fn rremove(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Get file metadata.
    ///
    /// Returns the `Stat` record describing the file represented by the fid.
    ///
    /// # Arguments
    /// * `fid` - The file fid to stat
    ///
    /// # Returns
    /// `FCall::RStat` containing the stat record, or an error.
    async fn rstat(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Set file metadata.
    ///
    /// Modifies the metadata of the file represented by the fid. Fields of `stat`
    /// set to their respective `wstat_sentinel` value are left unchanged; a
    /// `name` of the empty string leaves the name unchanged, as does a `length`
    /// field that is not the sentinel but still requires no truncation.
    ///
    /// # Arguments
    /// * `fid` - The file fid to modify
    /// * `stat` - The new attribute values, with unchanged fields set to sentinel values
    ///
    /// # Returns
    /// `FCall::RWStat` on success, or an error.
    async fn rwstat(&self, _: &FId<Self::FId>, _stat: &Stat) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Negotiate protocol version and message size.
    ///
    /// The first message in a 9P session. Negotiates the maximum message size and
    /// protocol version to use. The default implementation accepts 9P2000.u and
    /// returns VERSION_UNKNOWN for other versions.
    ///
    /// # Arguments
    /// * `msize` - Maximum message size the client can handle
    /// * `ver` - Protocol version string (e.g., "9P2000.u")
    ///
    /// # Returns
    /// `FCall::RVersion` with the negotiated msize and version.
    async fn rversion(&self, msize: u32, ver: &str) -> Result<FCall> {
        Ok(FCall::RVersion {
            msize,
            version: match ver {
                P92000U => ver.to_owned(),
                _ => VERSION_UNKNOWN.to_owned(),
            },
        })
    }
}

#[rustfmt::skip]
async fn dispatch_once<Fs, FsFId>(
    msg: &Msg,
    fs: Arc<Fs>,
    fsfids: Arc<RwLock<HashMap<u32, FId<FsFId>>>>,
) -> Result<FCall>
where
    Fs: Filesystem<FId = FsFId> + Send + Sync,
    FsFId: Send + Sync + Default,
{
    let newfid = msg.body.newfid().map(|f| FId {
        fid: f,
        aux: Default::default(),
    });

    use crate::FCall::*;
    let response = {
        let fids = fsfids.read().await;
        let get_fid = |fid: &u32| fids.get(fid).ok_or(error::Error::No(EBADF));
        let get_newfid = || newfid.as_ref().ok_or(error::Error::No(EPROTO));

        let fut = match msg.body {
            TAuth { afid: _, ref uname, ref aname, ref n_uname }                => fs.rauth(get_newfid()?, uname, aname, *n_uname),
            TAttach { fid: _, afid: _, ref uname, ref aname, ref n_uname }      => fs.rattach(get_newfid()?, None, uname, aname, *n_uname),
            TVersion { ref msize, ref version }                                 => fs.rversion(*msize, version),
            TFlush { oldtag: _ }                                                => fs.rflush(None),
            TWalk { fid, newfid: _, ref wnames }                                => fs.rwalk(get_fid(&fid)?, get_newfid()?, wnames),
            TOpen { fid, ref mode }                                            => fs.ropen(get_fid(&fid)?, *mode),
            TCreate { fid, ref name, ref perm, ref mode }                      => fs.rcreate(get_fid(&fid)?, name, *perm, *mode),
            TRead { fid, ref offset, ref count }                                => fs.rread(get_fid(&fid)?, *offset, *count),
            TWrite { fid, ref offset, ref data }                                => fs.rwrite(get_fid(&fid)?, *offset, data),
            TClunk { fid }                                                      => fs.rclunk(get_fid(&fid)?),
            TRemove { fid }                                                     => fs.rremove(get_fid(&fid)?),
            TStat { fid }                                                       => fs.rstat(get_fid(&fid)?),
            TWStat { fid, ref stat }                                           => fs.rwstat(get_fid(&fid)?, &stat.0),
            _                                                                   => return Err(error::Error::No(EOPNOTSUPP)),
        };

        fut.await
    };

    /* Drop the fid which the TClunk/TRemove contains, regardless of the result */
    if let TClunk { fid } | TRemove { fid } = msg.body {
        let mut fids = fsfids.write().await;
        fids.remove(&fid);
    }

    let response = response?;

    if let Some(newfid) = newfid {
        let mut fids = fsfids.write().await;
        fids.insert(newfid.fid, newfid);
    }

    Ok(response)
}

async fn dispatch<Fs, Reader, Writer>(filesystem: Fs, reader: Reader, writer: Writer) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync,
    Reader: 'static + AsyncRead + Send + std::marker::Unpin,
    Writer: 'static + AsyncWrite + Send + std::marker::Unpin,
{
    let fsfids = Arc::new(RwLock::new(HashMap::new()));
    let filesystem = Arc::new(filesystem);

    let mut framedread = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_read(reader);
    let framedwrite = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_write(writer);
    let framedwrite = Arc::new(Mutex::new(framedwrite));

    while let Some(bytes) = framedread.next().await {
        let bytes = bytes?;

        let msg = serialize::read_msg(&mut bytes.reader())?;
        info!("\t← {:?}", msg);

        let fids = fsfids.clone();
        let fs = filesystem.clone();
        let framedwrite = framedwrite.clone();

        tokio::spawn(async move {
            let response_fcall = dispatch_once(&msg, fs, fids).await.unwrap_or_else(|e| {
                error!("{:?}: Error: \"{}\": {:?}", MsgType::from(&msg.body), e, e);
                FCall::RlError {
                    ecode: e.errno() as u32,
                }
            });

            if MsgType::from(&response_fcall).is_r() {
                let response = Msg {
                    tag: msg.tag,
                    body: response_fcall,
                };

                let mut writer = bytes::BytesMut::with_capacity(4096).writer();
                if let Err(e) = serialize::write_msg(&mut writer, &response) {
                    error!("Failed to serialize response for tag {}: {:?}", msg.tag, e);
                    return;
                }

                let frozen = writer.into_inner().freeze();
                {
                    let mut framedwrite_locked = framedwrite.lock().await;
                    if let Err(e) = framedwrite_locked.send(frozen).await {
                        error!("Failed to send response for tag {}: {:?}", msg.tag, e);
                        return;
                    }
                }
                info!("\t→ {:?}", response);
            }
        });
    }

    Ok(())
}

async fn srv_async_tcp<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let fs = filesystem.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            let res = dispatch(fs, readhalf, writehalf).await;
            if let Err(e) = res {
                error!("Error: {}: {:?}", e, e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl std::ops::DerefMut for DeleteOnDrop {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            eprintln!(
                "Warning: Failed to remove socket file {:?}: {}",
                self.path, e
            );
        }
    }
}

pub async fn srv_async_unix<Fs>(filesystem: Fs, addr: impl AsRef<Path>) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

    {
        let running = running.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!("accepted: {:?}", peer);

                        let fs = filesystem.clone();
                        tokio::spawn(async move {
                            let (readhalf, writehalf) = tokio::io::split(stream);
                            let res = dispatch(fs, readhalf, writehalf).await;
                            if let Err(e) = res {
                                error!("Error: {:?}", e);
                            }
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                // Allow the server to check the running flag
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

pub async fn srv_async<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let (proto, host_or_path, port) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    match proto {
        "tcp" => srv_async_tcp(filesystem, &format!("{}:{}", host_or_path, port)).await,
        "unix" => srv_async_unix(filesystem, host_or_path).await,
        _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
    }
}
