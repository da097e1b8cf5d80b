//! In-flight instruction representation.
//!
//! An [`Instruction`] is born from a trace record in `init_instruction` and
//! lives in the fetch/decode/dispatch buffers and then the ROB until retire.
//! Pipeline progress is tracked per concern (translate, fetch, decode,
//! schedule, execute) with a three-state lifecycle; a stage never suspends,
//! it observes these fields and makes progress conditionally.

use crate::cpu::lsq::LsqRef;

/// Architectural register number of the stack pointer in trace encoding.
pub const REG_STACK_POINTER: u8 = 6;
/// Architectural register number of the flags register in trace encoding.
pub const REG_FLAGS: u8 = 25;
/// Architectural register number of the instruction pointer in trace encoding.
pub const REG_INSTRUCTION_POINTER: u8 = 26;

/// Lifecycle of one per-instruction concern.
///
/// Transitions are strictly `Pending → Inflight → Completed`; no stage moves
/// a field backward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Progress {
    /// Not yet started.
    #[default]
    Pending,
    /// Issued downstream; waiting on a queue or a return.
    Inflight,
    /// Done.
    Completed,
}

impl Progress {
    /// True unless the concern is still `Pending`.
    #[inline]
    pub fn started(self) -> bool {
        self != Progress::Pending
    }
}

/// Branch classification, in the priority order applied at trace intake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BranchKind {
    /// Not a control-flow instruction.
    #[default]
    NotBranch = 0,
    /// Unconditional direct jump.
    DirectJump = 1,
    /// Unconditional indirect branch.
    Indirect = 2,
    /// Conditional branch.
    Conditional = 3,
    /// Direct call.
    DirectCall = 4,
    /// Indirect call.
    IndirectCall = 5,
    /// Return.
    Return = 6,
    /// Writes the instruction pointer in some other pattern.
    Other = 7,
}

/// Stable reference to a ROB entry: slot plus the id expected there.
///
/// The ROB is a ring; a slot is reused after retire. Holders must validate
/// the id on every use and silently discard a stale handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RobRef {
    /// Slot index into the ROB storage array.
    pub slot: usize,
    /// Instruction id expected at that slot.
    pub id: u64,
}

/// One memory operand of an instruction.
#[derive(Clone, Debug, Default)]
pub struct MemOperand {
    /// Virtual address touched by the operand. Zero after a destination
    /// operand has drained at retire.
    pub address: u64,
    /// The operand has been handed to the LSQ (or satisfied by forwarding).
    pub added: bool,
    /// A prior in-flight store will forward to this source operand.
    pub will_forward: bool,
    /// Back-reference to the LQ/SQ slot servicing this operand.
    pub lsq: Option<LsqRef>,
}

impl MemOperand {
    /// Creates an operand for `address`.
    pub fn new(address: u64) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }
}

/// A decoded architectural instruction plus all pipeline bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct Instruction {
    /// Monotonic per-CPU id.
    pub id: u64,
    /// Instruction pointer.
    pub ip: u64,
    /// Physical address of the instruction after ITLB translation.
    pub instruction_pa: u64,
    /// Address-space ids carried through memory packets.
    pub asid: [u8; 2],

    /// Source architectural registers.
    pub source_registers: Vec<u8>,
    /// Destination architectural registers.
    pub destination_registers: Vec<u8>,
    /// Source memory operands.
    pub source_memory: Vec<MemOperand>,
    /// Destination memory operands.
    pub destination_memory: Vec<MemOperand>,

    /// Control-flow instruction.
    pub is_branch: bool,
    /// Classified branch kind.
    pub branch_kind: BranchKind,
    /// Architecturally taken.
    pub branch_taken: bool,
    /// Architectural target (zero for untaken branches).
    pub branch_target: u64,
    /// The front end mispredicted this branch and fetch must resume after
    /// the penalty once the misprediction is detected.
    pub branch_mispredicted: bool,

    /// Touches memory.
    pub is_memory: bool,
    /// Register operands not yet folded away.
    pub num_reg_ops: u32,
    /// Memory operands not yet satisfied.
    pub num_mem_ops: u32,
    /// Prior producers this instruction still waits on.
    pub num_reg_dependent: u32,

    /// ITLB translation progress.
    pub translated: Progress,
    /// L1I fetch progress.
    pub fetched: Progress,
    /// Decode progress (completed early on a DIB hit).
    pub decoded: Progress,
    /// Scheduling progress.
    pub scheduled: Progress,
    /// Execution progress.
    pub executed: Progress,

    /// Cycle at which the current stage's work becomes visible.
    pub event_cycle: u64,

    /// Consumers waiting on a register this instruction produces.
    pub reg_dependents: Vec<RobRef>,
    /// Loads waiting on a store address this instruction produces.
    pub mem_dependents: Vec<RobRef>,
}

impl Instruction {
    /// True when every source and destination memory operand has been
    /// accepted by the LSQ or satisfied by forwarding.
    pub fn all_mem_ops_added(&self) -> bool {
        self.source_memory.iter().all(|op| op.added)
            && self.destination_memory.iter().all(|op| op.added)
    }
}
