/// Global rank of a participant across the whole job (0-indexed).
pub type Rank = u32;

/// Rank of a device within its node (0-indexed).
pub type LocalRank = u32;

/// 64-bit identifier unique per (tensor, partition), used for signal routing
/// and parameter-server addressing.
pub type Key = u64;

/// Accelerator device ordinal. Negative means the tensor lives in host memory.
pub type DeviceId = i32;

/// Sentinel device id for tensors resident in host memory.
pub const CPU_DEVICE_ID: DeviceId = -1;

/// Data types supported by tessera for reduction and transfer.
///
/// tessera defines its own type enum so it remains a standalone library
/// usable by any training front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }

    /// Decode from the `repr(u8)` discriminant.
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => DataType::F32,
            1 => DataType::F64,
            2 => DataType::F16,
            3 => DataType::BF16,
            4 => DataType::I8,
            5 => DataType::I32,
            6 => DataType::I64,
            7 => DataType::U8,
            8 => DataType::U32,
            9 => DataType::U64,
            _ => return None,
        })
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations for collective communication.
///
/// The reduce pipeline only issues `Sum`; the full set is kept so backends
/// can expose the underlying collective library faithfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// The pipeline stages a partition can be queued on.
///
/// `SyncCollective` is intentionally absent: the sync stage is driven by the
/// group-batch hand-off, not by a per-partition queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum QueueKind {
    CoordinateReduce = 0,
    Reduce = 1,
    CoordinateBroadcast = 2,
    Broadcast = 3,
    CopyD2H = 4,
    Push = 5,
    Pull = 6,
    CopyH2D = 7,
}

impl QueueKind {
    /// Number of distinct stage queues.
    pub const COUNT: usize = 8;

    pub const fn name(self) -> &'static str {
        match self {
            QueueKind::CoordinateReduce => "coordinate_reduce",
            QueueKind::Reduce => "reduce",
            QueueKind::CoordinateBroadcast => "coordinate_broadcast",
            QueueKind::Broadcast => "broadcast",
            QueueKind::CopyD2H => "copy_d2h",
            QueueKind::Push => "push",
            QueueKind::Pull => "pull",
            QueueKind::CopyH2D => "copy_h2d",
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Request classes understood by the parameter server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    DefaultPushPull = 0,
}

/// Pack a request type and element dtype into the command word carried by
/// push/pull requests, so the server can aggregate typewise.
pub const fn command(req: RequestType, dtype: DataType) -> i32 {
    ((req as i32) << 16) | (dtype as i32)
}

/// Unpack the element dtype from a command word.
pub const fn command_dtype(cmd: i32) -> Option<DataType> {
    DataType::from_code((cmd & 0xff) as u8)
}
