#![allow(dead_code)]

//! Shared harness: a driven engine instance with a collecting sink, a
//! settable clock, and a plain uid/gid/mode security mapper, plus parsing
//! helpers for the wire messages the engine emits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fusebridge::proto::{self, Attr, AttrOut, EntryOut, InitOut, OpenOut};
use fusebridge::{
    Caller, Clock, CreateOptions, Disposition, FileAccess, FsOp, FsReply, FsRequest, FsResponse,
    Instance, ResponseSink, SecurityMapper, Status, VolumeParams,
};

pub const SEC: u64 = 1_000_000_000;

/// Collects every response the engine delivers.
#[derive(Default)]
pub struct CollectSink {
    responses: Mutex<Vec<FsResponse>>,
}

impl ResponseSink for CollectSink {
    fn deliver(&self, response: FsResponse) {
        self.responses.lock().unwrap().push(response);
    }
}

impl CollectSink {
    pub fn take(&self) -> Vec<FsResponse> {
        std::mem::take(&mut *self.responses.lock().unwrap())
    }

    pub fn take_one(&self) -> FsResponse {
        let mut responses = self.take();
        assert_eq!(
            responses.len(),
            1,
            "expected exactly one response, got {responses:?}"
        );
        responses.remove(0)
    }

    pub fn is_empty(&self) -> bool {
        self.responses.lock().unwrap().is_empty()
    }
}

/// Manually advanced clock, so expiry is fully deterministic.
#[derive(Default)]
pub struct TestClock(AtomicU64);

impl TestClock {
    pub fn set(&self, ticks: u64) {
        self.0.store(ticks, Ordering::Release);
    }
}

impl Clock for TestClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Encodes uid/gid/mode as three little-endian u32s.
pub struct PlainMapper;

impl SecurityMapper for PlainMapper {
    fn descriptor_from_posix(&self, uid: u32, gid: u32, mode: u32) -> Result<Bytes, Status> {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32_le(uid);
        buf.put_u32_le(gid);
        buf.put_u32_le(mode);
        Ok(buf.freeze())
    }

    fn posix_from_descriptor(
        &self,
        descriptor: &[u8],
    ) -> Result<(Option<u32>, Option<u32>, Option<u32>), Status> {
        let mut buf = descriptor;
        if buf.len() < 12 {
            return Err(Status::InvalidParameter);
        }
        Ok((
            Some(buf.get_u32_le()),
            Some(buf.get_u32_le()),
            Some(buf.get_u32_le()),
        ))
    }
}

/// A parsed outbound wire message.
#[derive(Debug)]
pub struct Msg {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub body: Bytes,
}

pub fn parse_message(mut buf: Bytes) -> Msg {
    let len = buf.get_u32_le();
    assert_eq!(
        len as usize,
        buf.len() + 4,
        "declared length covers the whole message"
    );
    let opcode = buf.get_u32_le();
    let unique = buf.get_u64_le();
    let nodeid = buf.get_u64_le();
    let uid = buf.get_u32_le();
    let gid = buf.get_u32_le();
    buf.advance(8); // pid, padding
    Msg {
        len,
        opcode,
        unique,
        nodeid,
        uid,
        gid,
        body: buf,
    }
}

pub struct Harness {
    pub inst: Instance,
    pub sink: Arc<CollectSink>,
    pub clock: Arc<TestClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(VolumeParams::default())
    }

    pub fn with_config(config: VolumeParams) -> Self {
        let sink = Arc::new(CollectSink::default());
        let clock = Arc::new(TestClock::default());
        let inst = Instance::with_clock(
            config,
            Arc::new(PlainMapper),
            Arc::clone(&sink) as Arc<dyn ResponseSink>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        Self { inst, sink, clock }
    }

    /// Next staged message, parsed. Panics when nothing is staged.
    pub fn msg(&self) -> Msg {
        parse_message(self.inst.next_message().expect("a message should be staged"))
    }

    pub fn expect(&self, opcode: proto::Opcode) -> Msg {
        let msg = self.msg();
        assert_eq!(msg.opcode, opcode as u32, "unexpected opcode in {msg:?}");
        msg
    }

    pub fn reply_ok(&self, unique: u64, payload: &[u8]) {
        self.inst
            .deliver_response(proto::encode_response(unique, 0, payload));
    }

    pub fn reply_err(&self, unique: u64, errno: i32) {
        self.inst
            .deliver_response(proto::encode_response(unique, errno, &[]));
    }

    /// Complete the INIT exchange with a protocol-7.31 remote.
    pub fn handshake(&self) {
        self.handshake_with(1 << 20);
    }

    pub fn handshake_with(&self, max_write: u32) {
        let init = self.expect(proto::Opcode::Init);
        let out = InitOut {
            major: 7,
            minor: 31,
            max_readahead: 0,
            flags: 0,
            max_write,
        };
        self.reply_ok(init.unique, &out.encode());
    }

    /// Open a not-yet-cached single-component path as root, scripting the
    /// LOOKUP and OPEN/OPENDIR exchange. Returns the host handle.
    pub fn open(&self, path: &str, attr: Attr, remote_fh: u64) -> u64 {
        self.open_with(path, attr, remote_fh, CreateOptions::empty())
    }

    pub fn open_with(&self, path: &str, attr: Attr, remote_fh: u64, options: CreateOptions) -> u64 {
        let is_dir = attr.mode & libc::S_IFMT == libc::S_IFDIR;
        self.inst.post(open_request(attr.ino, path, options));
        let lookup = self.expect(proto::Opcode::Lookup);
        self.reply_ok(lookup.unique, &entry_payload(attr, 100));
        let open = if is_dir {
            self.expect(proto::Opcode::Opendir)
        } else {
            self.expect(proto::Opcode::Open)
        };
        self.reply_ok(open.unique, &open_payload(remote_fh));
        match self.sink.take_one().result {
            Ok(FsReply::Create { fh, .. }) => fh,
            other => panic!("open of {path} failed: {other:?}"),
        }
    }

    /// Close a handle, scripting the RELEASE/RELEASEDIR exchange.
    pub fn close(&self, fh: u64, is_dir: bool) {
        self.inst.post(FsRequest {
            hint: 9000 + fh,
            caller: root_caller(),
            op: FsOp::Close { fh },
        });
        let release = if is_dir {
            self.expect(proto::Opcode::Releasedir)
        } else {
            self.expect(proto::Opcode::Release)
        };
        self.reply_ok(release.unique, &[]);
        assert!(matches!(self.sink.take_one().result, Ok(FsReply::Unit)));
    }
}

pub fn root_caller() -> Caller {
    Caller {
        uid: 0,
        gid: 0,
        pid: 1,
    }
}

pub fn file_attr(ino: u64, mode: u32) -> Attr {
    Attr {
        ino,
        mode: libc::S_IFREG | mode,
        nlink: 1,
        ..Attr::default()
    }
}

pub fn dir_attr(ino: u64, mode: u32) -> Attr {
    Attr {
        ino,
        mode: libc::S_IFDIR | mode,
        nlink: 2,
        ..Attr::default()
    }
}

pub fn entry_payload(attr: Attr, valid_secs: u64) -> Bytes {
    EntryOut {
        nodeid: attr.ino,
        generation: 0,
        entry_valid: valid_secs,
        attr_valid: valid_secs,
        entry_valid_nsec: 0,
        attr_valid_nsec: 0,
        attr,
    }
    .encode()
}

pub fn attr_payload(attr: Attr) -> Bytes {
    AttrOut {
        attr_valid: 100,
        attr_valid_nsec: 0,
        attr,
    }
    .encode()
}

pub fn open_payload(fh: u64) -> Bytes {
    OpenOut { fh, open_flags: 0 }.encode()
}

/// A plain open of an existing object, as root.
pub fn open_request(hint: u64, path: &str, options: CreateOptions) -> FsRequest {
    FsRequest {
        hint,
        caller: root_caller(),
        op: FsOp::Create {
            path: path.to_owned(),
            access: FileAccess::READ_DATA,
            disposition: Disposition::Open,
            options,
            mode: 0,
            security: None,
        },
    }
}
