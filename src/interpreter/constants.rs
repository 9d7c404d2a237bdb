// Constants for the simulator

/// Starting address for heap allocations
/// Heap addresses start at 0x10000000 to clearly distinguish them from stack addresses
pub const HEAP_ADDRESS_START: u64 = 0x1000_0000;

/// Starting address for stack slot addresses
/// Stack addresses start at 0x00000008
pub const STACK_ADDRESS_START: u64 = 0x0000_0008;

/// Address stride between consecutive slots (every slot occupies one word)
pub const SLOT_SIZE: u64 = 8;

/// Default cap on recorded trace events
pub const DEFAULT_TRACE_LIMIT: usize = 100_000;

/// Default entry function
pub const DEFAULT_ENTRY: &str = "main";
