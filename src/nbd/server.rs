//! NBD server
//!
//! One thread per TCP connection: handshake, option negotiation binding an
//! export, then the request/response loop. The export's container lock is
//! held from negotiation success until connection teardown, so a second
//! client naming the same export fails during negotiation.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};

use super::protocol::*;
use crate::client::ObjectStore;
use crate::stats::ExportStats;
use crate::storage::{StorageError, SwiftStorage};

/// One published export.
pub struct Export<C> {
    pub storage: Mutex<SwiftStorage<C>>,
    pub stats: Arc<ExportStats>,
}

/// NBD server over a set of named exports.
pub struct NbdServer<C> {
    bind_addr: String,
    exports: Arc<HashMap<String, Export<C>>>,
    stop: Arc<AtomicBool>,
}

impl<C: ObjectStore + 'static> NbdServer<C> {
    pub fn new(bind_addr: &str, exports: HashMap<String, Export<C>>, stop: Arc<AtomicBool>) -> Self {
        Self {
            bind_addr: bind_addr.to_string(),
            exports: Arc::new(exports),
            stop,
        }
    }

    /// Bind and serve until the stop flag is raised.
    pub fn run(&self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)?;
        self.serve(listener)
    }

    /// Serve on an already-bound listener. The accept loop polls the stop
    /// flag; in-flight connections finish their current request and tear
    /// down on their own.
    pub fn serve(&self, listener: TcpListener) -> io::Result<()> {
        log::info!("NBD server listening on {}", listener.local_addr()?);
        listener.set_nonblocking(true)?;

        while !self.stop.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    let exports = Arc::clone(&self.exports);
                    thread::spawn(move || {
                        if let Err(err) = handle_client(stream, peer, exports) {
                            log::error!("[{}] {}", peer, err);
                        }
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(err) => log::error!("Connection error: {}", err),
            }
        }

        self.unlock_all();
        Ok(())
    }

    /// Release any container lock still held, e.g. on shutdown.
    pub fn unlock_all(&self) {
        for (name, export) in self.exports.iter() {
            let mut storage = export.storage.lock().unwrap();
            if storage.locked() {
                log::debug!("{}: unlocking storage", name);
                if let Err(err) = storage.unlock() {
                    log::error!("{}: {}", name, err);
                }
            }
        }
    }
}

/// Handle one connection from handshake to teardown, unlocking the bound
/// export on the way out.
fn handle_client<C: ObjectStore>(
    stream: TcpStream,
    peer: SocketAddr,
    exports: Arc<HashMap<String, Export<C>>>,
) -> io::Result<()> {
    log::info!("Incoming connection from {}", peer);

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let mut bound = None;
    let result = serve_connection(&mut reader, &mut writer, peer, &exports, &mut bound);

    if let Some(export) = bound.and_then(|name| exports.get(&name)) {
        let mut storage = export.storage.lock().unwrap();
        if let Err(err) = storage.unlock() {
            log::error!("[{}] {}", peer, err);
        }
    }

    match result {
        Err(err) if err.kind() == io::ErrorKind::ConnectionAborted => {
            log::info!("[{}] client aborted negotiation", peer);
            Ok(())
        }
        other => other,
    }
}

fn serve_connection<C: ObjectStore>(
    reader: &mut BufReader<TcpStream>,
    writer: &mut BufWriter<TcpStream>,
    peer: SocketAddr,
    exports: &HashMap<String, Export<C>>,
    bound: &mut Option<String>,
) -> io::Result<()> {
    // initial handshake
    write_greeting(writer)?;

    let client_flags = reader.read_u32::<BigEndian>()?;
    let fixed = if client_flags == 0 {
        log::warn!("[{}] client using new-style non-fixed handshake", peer);
        false
    } else if client_flags & NBD_FLAG_C_FIXED_NEWSTYLE != 0 {
        true
    } else {
        return Err(protocol_error("handshake failed"));
    };

    // negotiation phase
    let export = loop {
        let option = NbdOption::read(reader)?;
        log::debug!("[{}] opt={}, len={}", peer, option.opt, option.data.len());

        match option.opt {
            NBD_OPT_EXPORT_NAME => {
                if option.data.is_empty() {
                    return Err(protocol_error("no export name was provided"));
                }
                let name = String::from_utf8(option.data)
                    .map_err(|_| protocol_error("export name is not valid UTF-8"))?;

                let export = match exports.get(&name) {
                    Some(export) => export,
                    None => {
                        if !fixed {
                            return Err(protocol_error("unknown export name"));
                        }
                        write_option_reply(writer, NBD_OPT_EXPORT_NAME, NBD_REP_ERR_UNSUP, &[])?;
                        continue;
                    }
                };

                let (size, read_only) = {
                    let mut storage = export.storage.lock().unwrap();
                    // the lock is per storage instance, so a connection
                    // already bound to this export must be refused here
                    let held = if storage.locked() {
                        Err(StorageError::Busy(format!("{} on this server", name)))
                    } else {
                        storage.lock(&peer.to_string())
                    };
                    if let Err(err) = held {
                        log::error!("[{}] {}", peer, err);
                        if fixed {
                            write_option_reply(
                                writer,
                                NBD_OPT_EXPORT_NAME,
                                NBD_REP_ERR_UNSUP,
                                &[],
                            )?;
                        }
                        return Err(protocol_error("negotiation failed"));
                    }
                    (storage.size(), storage.read_only())
                };
                *bound = Some(name.clone());

                log::info!("[{}] negotiated export: {}", peer, name);

                let mut flags = NBD_EXPORT_FLAGS;
                if read_only {
                    flags |= NBD_FLAG_READ_ONLY;
                    log::info!("[{}] {} is read only", peer, name);
                }
                write_export_details(writer, size, flags)?;
                break export;
            }

            NBD_OPT_LIST => {
                for name in exports.keys() {
                    let mut data = Vec::with_capacity(name.len() + 4);
                    data.extend_from_slice(&(name.len() as u32).to_be_bytes());
                    data.extend_from_slice(name.as_bytes());
                    write_option_reply(writer, NBD_OPT_LIST, NBD_REP_SERVER, &data)?;
                }
                write_option_reply(writer, NBD_OPT_LIST, NBD_REP_ACK, &[])?;
            }

            NBD_OPT_ABORT => {
                write_option_reply(writer, NBD_OPT_ABORT, NBD_REP_ACK, &[])?;
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "client aborted negotiation",
                ));
            }

            opt => {
                if !fixed {
                    return Err(protocol_error(format!("unsupported option: {}", opt)));
                }
                write_option_reply(writer, opt, NBD_REP_ERR_UNSUP, &[])?;
            }
        }
    };

    // operation phase
    loop {
        let request = match NbdRequest::read(reader) {
            Ok(request) => request,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                log::info!("[{}] client disconnected", peer);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        log::debug!(
            "[{}] cmd={}, handle={}, offset={}, len={}",
            peer,
            request.command,
            request.handle,
            request.offset,
            request.length
        );

        match request.command_type() {
            Some(NbdCommand::Disc) => {
                log::info!("[{}] disconnecting", peer);
                return Ok(());
            }

            Some(NbdCommand::Write) => {
                let mut data = vec![0u8; request.length as usize];
                reader.read_exact(&mut data)?;

                let result = {
                    let mut storage = export.storage.lock().unwrap();
                    storage
                        .seek(request.offset)
                        .and_then(|_| storage.write(&data))
                };
                match result {
                    Ok(()) => {
                        export
                            .stats
                            .srv_in
                            .fetch_add(request.length as u64, Ordering::Relaxed);
                        nbd_response(writer, request.handle, 0, None)?;
                    }
                    Err(err) => {
                        log::error!("[{}] {}", peer, err);
                        nbd_response(writer, request.handle, err.errno(), None)?;
                    }
                }
            }

            Some(NbdCommand::Read) => {
                let result = {
                    let mut storage = export.storage.lock().unwrap();
                    storage
                        .seek(request.offset)
                        .and_then(|_| storage.read(request.length as u64))
                };
                match result {
                    Ok(data) => {
                        export
                            .stats
                            .srv_out
                            .fetch_add(data.len() as u64, Ordering::Relaxed);
                        nbd_response(writer, request.handle, 0, Some(&data))?;
                    }
                    Err(err) => {
                        log::error!("[{}] {}", peer, err);
                        nbd_response(writer, request.handle, err.errno(), None)?;
                    }
                }
            }

            Some(NbdCommand::Flush) => {
                export.storage.lock().unwrap().flush();
                nbd_response(writer, request.handle, 0, None)?;
            }

            None => {
                log::warn!("[{}] unknown cmd {}, disconnecting", peer, request.command);
                return Ok(());
            }
        }
    }
}

fn nbd_response<W: Write>(
    writer: &mut W,
    handle: u64,
    error: u32,
    data: Option<&[u8]>,
) -> io::Result<()> {
    NbdReply::new(handle, error).write(writer)?;
    if let Some(data) = data {
        writer.write_all(data)?;
    }
    writer.flush()
}

fn protocol_error<S: Into<String>>(message: S) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}
