//! Host identity and status records exchanged at handshake and in STAT
//! replies.

use shared::{str_size, Reader, Record, WireError, Writer};

/// What a peer announces about itself when connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    /// Host name.
    pub name: String,
    /// Process id.
    pub pid: u32,
    /// Solver threads this host offers.
    pub n_threads: u16,
    /// Unix start time of the process, seconds.
    pub start_time: u64,
    /// Architecture label, e.g. `x86_64-linux`.
    pub arch: String,
    /// Endian flag, 1 for little-endian.
    pub little_endian: u8,
}

impl HostInfo {
    /// Describe the current process.
    pub fn local(n_threads: u16) -> Self {
        let name = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let start_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            name,
            pid: std::process::id(),
            n_threads,
            start_time,
            arch: format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
            little_endian: if cfg!(target_endian = "little") { 1 } else { 0 },
        }
    }
}

impl Record for HostInfo {
    fn wire_size(&self) -> u64 {
        str_size(&self.name) + 4 + 2 + 8 + str_size(&self.arch) + 1
    }

    fn pack(&self, w: &mut Writer) {
        w.put_str(&self.name);
        w.put_u32(self.pid);
        w.put_u16(self.n_threads);
        w.put_u64(self.start_time);
        w.put_str(&self.arch);
        w.put_u8(self.little_endian);
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            name: r.get_str()?,
            pid: r.get_u32()?,
            n_threads: r.get_u16()?,
            start_time: r.get_u64()?,
            arch: r.get_str()?,
            little_endian: r.get_u8()?,
        })
    }
}

/// A peer's current load, reported in STAT replies.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HostStatus {
    /// 0 idle, 1 processing, 2 draining.
    pub state: u8,
    /// Load average of the host.
    pub load: f32,
    /// Job currently held, 0 when idle.
    pub current_job: u64,
    /// Part currently held, 0 when idle.
    pub current_part: u64,
}

impl Record for HostStatus {
    fn wire_size(&self) -> u64 {
        1 + 4 + 8 + 8
    }

    fn pack(&self, w: &mut Writer) {
        w.put_u8(self.state);
        w.put_f32(self.load);
        w.put_u64(self.current_job);
        w.put_u64(self.current_part);
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            state: r.get_u8()?,
            load: r.get_f32()?,
            current_job: r.get_u64()?,
            current_part: r.get_u64()?,
        })
    }
}
