//! End-to-end NBD protocol tests against an in-memory object store.
//!
//! Each test binds a server on an ephemeral port and drives it with a
//! minimal NBD client speaking the fixed-newstyle handshake.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use swiftnbd::cache::Cache;
use swiftnbd::client::{MemoryStore, ObjectStore};
use swiftnbd::meta;
use swiftnbd::nbd::protocol::*;
use swiftnbd::nbd::server::{Export, NbdServer};
use swiftnbd::stats::ExportStats;
use swiftnbd::storage::{object_name, SwiftStorage};

const OBJECT_SIZE: u64 = 512;
const OBJECTS: u64 = 16;
const SIZE: u64 = OBJECT_SIZE * OBJECTS;

struct TestServer {
    addr: SocketAddr,
    store: MemoryStore,
    stop: Arc<AtomicBool>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn setup_container(store: &MemoryStore, name: &str) {
    let mut meta = HashMap::new();
    meta.insert("version".to_string(), meta::DISK_VERSION.to_string());
    meta.insert("objects".to_string(), OBJECTS.to_string());
    meta.insert("object-size".to_string(), OBJECT_SIZE.to_string());
    meta.insert("client".to_string(), String::new());
    meta.insert("last".to_string(), String::new());
    store.put_container(name, &meta::set_meta(&meta)).unwrap();
}

fn start_server(exports: &[(&str, bool)]) -> TestServer {
    let store = MemoryStore::new();
    let mut map = HashMap::new();

    for &(name, read_only) in exports {
        setup_container(&store, name);
        let stats = Arc::new(ExportStats::new(name, OBJECT_SIZE, 16));
        let storage = SwiftStorage::new(
            store.clone(),
            name,
            OBJECT_SIZE,
            OBJECTS,
            Cache::new(16),
            read_only,
            Arc::clone(&stats),
        );
        map.insert(
            name.to_string(),
            Export {
                storage: Mutex::new(storage),
                stats,
            },
        );
    }

    let stop = Arc::new(AtomicBool::new(false));
    let server = NbdServer::new("127.0.0.1:0", map, Arc::clone(&stop));
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let _ = server.serve(listener);
    });

    TestServer { addr, store, stop }
}

struct NbdClient {
    stream: TcpStream,
}

impl NbdClient {
    fn connect(addr: SocketAddr) -> Self {
        Self::connect_with_flags(addr, NBD_FLAG_C_FIXED_NEWSTYLE)
    }

    fn connect_with_flags(addr: SocketAddr, client_flags: u32) -> Self {
        let mut stream = TcpStream::connect(addr).unwrap();

        let mut magic = [0u8; 8];
        stream.read_exact(&mut magic).unwrap();
        assert_eq!(&magic, b"NBDMAGIC");
        assert_eq!(stream.read_u64::<BigEndian>().unwrap(), NBD_OPTS_MAGIC);
        let flags = stream.read_u16::<BigEndian>().unwrap();
        assert_eq!(flags & NBD_HANDSHAKE_FLAGS, NBD_HANDSHAKE_FLAGS);

        stream.write_u32::<BigEndian>(client_flags).unwrap();
        Self { stream }
    }

    fn send_option(&mut self, opt: u32, data: &[u8]) {
        self.stream.write_u64::<BigEndian>(NBD_OPTS_MAGIC).unwrap();
        self.stream.write_u32::<BigEndian>(opt).unwrap();
        self.stream
            .write_u32::<BigEndian>(data.len() as u32)
            .unwrap();
        self.stream.write_all(data).unwrap();
    }

    fn read_option_reply(&mut self) -> (u32, u32, Vec<u8>) {
        assert_eq!(self.stream.read_u64::<BigEndian>().unwrap(), NBD_REP_MAGIC);
        let opt = self.stream.read_u32::<BigEndian>().unwrap();
        let reply = self.stream.read_u32::<BigEndian>().unwrap();
        let length = self.stream.read_u32::<BigEndian>().unwrap();
        let mut data = vec![0u8; length as usize];
        self.stream.read_exact(&mut data).unwrap();
        (opt, reply, data)
    }

    /// EXPORT_NAME negotiation; returns the export details.
    fn negotiate(&mut self, export: &str) -> (u64, u16) {
        self.send_option(NBD_OPT_EXPORT_NAME, export.as_bytes());
        let size = self.stream.read_u64::<BigEndian>().unwrap();
        let flags = self.stream.read_u16::<BigEndian>().unwrap();
        let mut padding = [0u8; 124];
        self.stream.read_exact(&mut padding).unwrap();
        assert_eq!(padding, [0u8; 124]);
        (size, flags)
    }

    fn request(&mut self, command: u32, offset: u64, length: u32, payload: Option<&[u8]>) {
        self.stream
            .write_u32::<BigEndian>(NBD_REQUEST_MAGIC)
            .unwrap();
        self.stream.write_u32::<BigEndian>(command).unwrap();
        self.stream.write_u64::<BigEndian>(0x1234).unwrap();
        self.stream.write_u64::<BigEndian>(offset).unwrap();
        self.stream.write_u32::<BigEndian>(length).unwrap();
        if let Some(data) = payload {
            self.stream.write_all(data).unwrap();
        }
    }

    /// Read a simple reply; the payload is read only on success.
    fn response(&mut self, payload_len: usize) -> (u32, Vec<u8>) {
        assert_eq!(
            self.stream.read_u32::<BigEndian>().unwrap(),
            NBD_RESPONSE_MAGIC
        );
        let error = self.stream.read_u32::<BigEndian>().unwrap();
        let handle = self.stream.read_u64::<BigEndian>().unwrap();
        assert_eq!(handle, 0x1234);

        let mut data = vec![0u8; if error == 0 { payload_len } else { 0 }];
        self.stream.read_exact(&mut data).unwrap();
        (error, data)
    }

    fn read(&mut self, offset: u64, length: u32) -> (u32, Vec<u8>) {
        self.request(0, offset, length, None);
        self.response(length as usize)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> u32 {
        self.request(1, offset, data.len() as u32, Some(data));
        self.response(0).0
    }

    fn flush(&mut self) -> u32 {
        self.request(3, 0, 0, None);
        self.response(0).0
    }

    fn disconnect(mut self) {
        self.request(2, 0, 0, None);
    }

    /// The server closed the connection if reading yields EOF.
    fn assert_closed(&mut self) {
        self.stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 1];
        match self.stream.read(&mut buf) {
            Ok(0) => {}
            other => panic!("expected EOF, got {:?}", other),
        }
    }
}

/// Wait for the server to release the container lock after a teardown.
fn wait_unlocked(store: &MemoryStore, container: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let meta = meta::get_meta(&store.headers(container).unwrap());
        if meta.get("client").is_none() {
            return;
        }
        assert!(Instant::now() < deadline, "lock was not released");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_export_details() {
    let server = start_server(&[("disk0", false)]);
    let mut client = NbdClient::connect(server.addr);

    let (size, flags) = client.negotiate("disk0");
    assert_eq!(size, SIZE);
    assert_eq!(flags, NBD_EXPORT_FLAGS);
    assert_eq!(flags & NBD_FLAG_READ_ONLY, 0);

    client.disconnect();
}

#[test]
fn test_read_never_written_region() {
    let server = start_server(&[("disk0", false)]);
    let mut client = NbdClient::connect(server.addr);
    client.negotiate("disk0");

    let (error, data) = client.read(0, 512);
    assert_eq!(error, 0);
    assert_eq!(data, vec![0u8; 512]);

    client.disconnect();
}

#[test]
fn test_full_object_write_then_read() {
    let server = start_server(&[("disk0", false)]);
    let mut client = NbdClient::connect(server.addr);
    client.negotiate("disk0");

    assert_eq!(client.write(0, &[b'X'; 512]), 0);

    let (error, data) = client.read(0, 512);
    assert_eq!(error, 0);
    assert_eq!(data, vec![b'X'; 512]);

    assert_eq!(
        server.store.object("disk0", &object_name(0)).unwrap(),
        vec![b'X'; 512]
    );

    client.disconnect();
}

#[test]
fn test_cross_object_write_with_edges() {
    let server = start_server(&[("disk0", false)]);
    let mut client = NbdClient::connect(server.addr);
    client.negotiate("disk0");

    assert_eq!(client.write(256, &[b'X'; 512]), 0);

    let mut first = vec![0u8; 256];
    first.extend_from_slice(&[b'X'; 256]);
    assert_eq!(server.store.object("disk0", &object_name(0)).unwrap(), first);

    let mut second = vec![b'X'; 256];
    second.extend_from_slice(&[0u8; 256]);
    assert_eq!(
        server.store.object("disk0", &object_name(1)).unwrap(),
        second
    );

    client.disconnect();
}

#[test]
fn test_out_of_range_write() {
    let server = start_server(&[("disk0", false)]);
    let mut client = NbdClient::connect(server.addr);
    client.negotiate("disk0");

    // covers object indexes past the end of the disk
    let error = client.write(15 * 512 + 256, &[b'X'; 1024]);
    assert_eq!(error, libc::ESPIPE as u32);
    assert!(server.store.object_names("disk0").is_empty());

    // the connection survives the error
    let (error, data) = client.read(0, 512);
    assert_eq!(error, 0);
    assert_eq!(data, vec![0u8; 512]);

    client.disconnect();
}

#[test]
fn test_read_only_export() {
    let server = start_server(&[("disk0", true)]);
    let mut client = NbdClient::connect(server.addr);

    let (_, flags) = client.negotiate("disk0");
    assert_eq!(flags & NBD_FLAG_READ_ONLY, NBD_FLAG_READ_ONLY);

    let error = client.write(0, &[b'X'; 512]);
    assert_eq!(error, libc::EROFS as u32);
    assert!(server.store.object_names("disk0").is_empty());

    let (error, data) = client.read(0, 512);
    assert_eq!(error, 0);
    assert_eq!(data, vec![0u8; 512]);

    client.disconnect();
}

#[test]
fn test_lock_contention() {
    let server = start_server(&[("disk0", false)]);
    let mut first = NbdClient::connect(server.addr);
    first.negotiate("disk0");

    // the second client is refused while the first holds the lock
    let mut second = NbdClient::connect(server.addr);
    second.send_option(NBD_OPT_EXPORT_NAME, b"disk0");
    let (opt, reply, _) = second.read_option_reply();
    assert_eq!(opt, NBD_OPT_EXPORT_NAME);
    assert_eq!(reply, NBD_REP_ERR_UNSUP);
    second.assert_closed();

    // metadata still records the first connection as the holder
    let meta = meta::get_meta(&server.store.headers("disk0").unwrap());
    assert!(meta.get("client").unwrap().starts_with("127.0.0.1:"));

    // the first connection is still fully usable
    assert_eq!(first.write(0, &[b'A'; 512]), 0);

    first.disconnect();
    wait_unlocked(&server.store, "disk0");

    // once released, a new client can negotiate the export
    let mut third = NbdClient::connect(server.addr);
    let (size, _) = third.negotiate("disk0");
    assert_eq!(size, SIZE);
    third.disconnect();
}

#[test]
fn test_list_then_abort() {
    let server = start_server(&[("disk0", false), ("disk1", false)]);
    let mut client = NbdClient::connect(server.addr);

    client.send_option(NBD_OPT_LIST, &[]);

    let mut names = HashSet::new();
    loop {
        let (opt, reply, data) = client.read_option_reply();
        assert_eq!(opt, NBD_OPT_LIST);
        match reply {
            NBD_REP_SERVER => {
                let mut cursor = std::io::Cursor::new(&data);
                let length = cursor.read_u32::<BigEndian>().unwrap() as usize;
                let name = String::from_utf8(data[4..4 + length].to_vec()).unwrap();
                names.insert(name);
            }
            NBD_REP_ACK => break,
            other => panic!("unexpected reply type {}", other),
        }
    }
    assert_eq!(
        names,
        HashSet::from(["disk0".to_string(), "disk1".to_string()])
    );

    client.send_option(NBD_OPT_ABORT, &[]);
    let (opt, reply, _) = client.read_option_reply();
    assert_eq!(opt, NBD_OPT_ABORT);
    assert_eq!(reply, NBD_REP_ACK);
    client.assert_closed();
}

#[test]
fn test_unknown_export_fixed() {
    let server = start_server(&[("disk0", false)]);
    let mut client = NbdClient::connect(server.addr);

    // fixed clients get an error reply and may continue negotiating
    client.send_option(NBD_OPT_EXPORT_NAME, b"nope");
    let (opt, reply, _) = client.read_option_reply();
    assert_eq!(opt, NBD_OPT_EXPORT_NAME);
    assert_eq!(reply, NBD_REP_ERR_UNSUP);

    let (size, _) = client.negotiate("disk0");
    assert_eq!(size, SIZE);
    client.disconnect();
}

#[test]
fn test_unknown_export_unfixed() {
    let server = start_server(&[("disk0", false)]);
    let mut client = NbdClient::connect_with_flags(server.addr, 0);

    client.send_option(NBD_OPT_EXPORT_NAME, b"nope");
    client.assert_closed();
}

#[test]
fn test_unknown_option_fixed() {
    let server = start_server(&[("disk0", false)]);
    let mut client = NbdClient::connect(server.addr);

    client.send_option(8, &[]);
    let (opt, reply, _) = client.read_option_reply();
    assert_eq!(opt, 8);
    assert_eq!(reply, NBD_REP_ERR_UNSUP);

    let (size, _) = client.negotiate("disk0");
    assert_eq!(size, SIZE);
    client.disconnect();
}

#[test]
fn test_flush_drops_cache() {
    let server = start_server(&[("disk0", false)]);
    let mut client = NbdClient::connect(server.addr);
    client.negotiate("disk0");

    assert_eq!(client.write(0, &[b'X'; 512]), 0);

    // the written object is served from cache
    let gets_before = server.store.get_count();
    let (error, _) = client.read(0, 512);
    assert_eq!(error, 0);
    assert_eq!(server.store.get_count(), gets_before);

    assert_eq!(client.flush(), 0);

    // after a flush the next read goes back to the store
    let (error, data) = client.read(0, 512);
    assert_eq!(error, 0);
    assert_eq!(data, vec![b'X'; 512]);
    assert_eq!(server.store.get_count(), gets_before + 1);

    client.disconnect();
}

#[test]
fn test_disconnect_releases_lock() {
    let server = start_server(&[("disk0", false)]);

    let mut client = NbdClient::connect(server.addr);
    client.negotiate("disk0");
    assert!(meta::get_meta(&server.store.headers("disk0").unwrap())
        .get("client")
        .is_some());

    client.disconnect();
    wait_unlocked(&server.store, "disk0");

    let meta = meta::get_meta(&server.store.headers("disk0").unwrap());
    assert!(meta.get("last").unwrap().starts_with("127.0.0.1:"));
}

#[test]
fn test_unaligned_write_read_round_trip() {
    let server = start_server(&[("disk0", false)]);
    let mut client = NbdClient::connect(server.addr);
    client.negotiate("disk0");

    let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(client.write(700, &data), 0);

    let (error, read_back) = client.read(700, data.len() as u32);
    assert_eq!(error, 0);
    assert_eq!(read_back, data);

    // neighbours of the written range are untouched
    let (error, before) = client.read(0, 700);
    assert_eq!(error, 0);
    assert_eq!(before, vec![0u8; 700]);

    client.disconnect();
}

#[test]
fn test_every_object_put_is_whole() {
    let server = start_server(&[("disk0", false)]);
    let mut client = NbdClient::connect(server.addr);
    client.negotiate("disk0");

    assert_eq!(client.write(100, &[b'Z'; 1000]), 0);

    for name in server.store.object_names("disk0") {
        assert!(name.starts_with("disk.part/"));
        assert_eq!(name.len(), "disk.part/".len() + 8);
        let data = server.store.object("disk0", &name).unwrap();
        assert_eq!(data.len() as u64, OBJECT_SIZE);
    }

    client.disconnect();
}
