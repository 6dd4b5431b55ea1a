// Stack VM Instruction Set
// Opcodes, operand classes, and the per-version byte tables

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// How an opcode's operand is resolved by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operand
    None,
    /// Index into the constant pool
    Const,
    /// Index into the name table
    Name,
    /// Index into the local-variable name table
    Local,
    /// Index into cell variables followed by free variables
    Free,
    /// Two local indices packed into the high and low nibble
    LocalPair,
    /// Offset relative to the instruction pointer after the read
    RelativeJump,
    /// Absolute instruction offset
    AbsoluteJump,
    /// Raw integer passed through untouched
    Raw,
}

macro_rules! opcodes {
    ($($variant:ident => $name:literal, $kind:ident;)*) => {
        /// Bytecode operation codes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            /// Canonical upper-case instruction name
            pub fn name(&self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }

            pub fn operand_kind(&self) -> OperandKind {
                match self {
                    $(Opcode::$variant => OperandKind::$kind,)*
                }
            }
        }
    };
}

opcodes! {
    // Stack manipulation
    PopTop => "POP_TOP", None;
    RotTwo => "ROT_TWO", None;
    RotThree => "ROT_THREE", None;
    DupTop => "DUP_TOP", None;
    DupTopTwo => "DUP_TOP_TWO", None;
    Nop => "NOP", None;

    // Unary operators
    UnaryPositive => "UNARY_POSITIVE", None;
    UnaryNegative => "UNARY_NEGATIVE", None;
    UnaryNot => "UNARY_NOT", None;
    UnaryInvert => "UNARY_INVERT", None;

    // Binary operators
    BinaryPower => "BINARY_POWER", None;
    BinaryMultiply => "BINARY_MULTIPLY", None;
    BinaryModulo => "BINARY_MODULO", None;
    BinaryAdd => "BINARY_ADD", None;
    BinarySubtract => "BINARY_SUBTRACT", None;
    BinarySubscr => "BINARY_SUBSCR", None;
    BinaryFloorDivide => "BINARY_FLOOR_DIVIDE", None;
    BinaryTrueDivide => "BINARY_TRUE_DIVIDE", None;
    BinaryLshift => "BINARY_LSHIFT", None;
    BinaryRshift => "BINARY_RSHIFT", None;
    BinaryAnd => "BINARY_AND", None;
    BinaryXor => "BINARY_XOR", None;
    BinaryOr => "BINARY_OR", None;
    InplaceAdd => "INPLACE_ADD", None;
    InplaceSubtract => "INPLACE_SUBTRACT", None;
    InplaceMultiply => "INPLACE_MULTIPLY", None;
    InplaceModulo => "INPLACE_MODULO", None;
    InplaceFloorDivide => "INPLACE_FLOOR_DIVIDE", None;
    InplaceTrueDivide => "INPLACE_TRUE_DIVIDE", None;
    StoreSubscr => "STORE_SUBSCR", None;
    StoreMap => "STORE_MAP", None;

    // Iteration and blocks
    GetIter => "GET_ITER", None;
    BreakLoop => "BREAK_LOOP", None;
    ReturnValue => "RETURN_VALUE", None;
    PopBlock => "POP_BLOCK", None;
    EndFinally => "END_FINALLY", None;
    PopExcept => "POP_EXCEPT", None;

    // Names
    StoreName => "STORE_NAME", Name;
    DeleteName => "DELETE_NAME", Name;
    UnpackSequence => "UNPACK_SEQUENCE", Raw;
    ForIter => "FOR_ITER", RelativeJump;
    StoreAttr => "STORE_ATTR", Name;
    StoreGlobal => "STORE_GLOBAL", Name;
    LoadConst => "LOAD_CONST", Const;
    LoadName => "LOAD_NAME", Name;
    BuildTuple => "BUILD_TUPLE", Raw;
    BuildList => "BUILD_LIST", Raw;
    BuildMap => "BUILD_MAP", Raw;
    LoadAttr => "LOAD_ATTR", Name;
    CompareOp => "COMPARE_OP", Raw;

    // Jumps
    JumpForward => "JUMP_FORWARD", RelativeJump;
    JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP", AbsoluteJump;
    JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP", AbsoluteJump;
    JumpAbsolute => "JUMP_ABSOLUTE", AbsoluteJump;
    PopJumpIfFalse => "POP_JUMP_IF_FALSE", AbsoluteJump;
    PopJumpIfTrue => "POP_JUMP_IF_TRUE", AbsoluteJump;
    LoadGlobal => "LOAD_GLOBAL", Name;
    ContinueLoop => "CONTINUE_LOOP", AbsoluteJump;
    SetupLoop => "SETUP_LOOP", RelativeJump;
    SetupExcept => "SETUP_EXCEPT", RelativeJump;
    SetupFinally => "SETUP_FINALLY", RelativeJump;

    // Locals and closures
    LoadFast => "LOAD_FAST", Local;
    StoreFast => "STORE_FAST", Local;
    DeleteFast => "DELETE_FAST", Local;
    RaiseVarargs => "RAISE_VARARGS", Raw;
    CallFunction => "CALL_FUNCTION", Raw;
    MakeFunction => "MAKE_FUNCTION", Raw;
    MakeClosure => "MAKE_CLOSURE", Raw;
    LoadClosure => "LOAD_CLOSURE", Free;
    LoadDeref => "LOAD_DEREF", Free;
    StoreDeref => "STORE_DEREF", Free;
    ListAppend => "LIST_APPEND", Raw;

    // Wordcode-only instructions
    Cache => "CACHE", None;
    ExtendedArg => "EXTENDED_ARG", Raw;
    Resume => "RESUME", Raw;
    BinaryOp => "BINARY_OP", Raw;
    Copy => "COPY", Raw;
    Swap => "SWAP", Raw;
    Precall => "PRECALL", Raw;
    Call => "CALL", Raw;
    LoadFastLoadFast => "LOAD_FAST_LOAD_FAST", LocalPair;
}

/// First Classic opcode byte that carries an operand
pub const HAVE_ARGUMENT: u8 = 90;

const CLASSIC_TABLE: &[(u8, Opcode)] = &[
    (1, Opcode::PopTop),
    (2, Opcode::RotTwo),
    (3, Opcode::RotThree),
    (4, Opcode::DupTop),
    (5, Opcode::DupTopTwo),
    (9, Opcode::Nop),
    (10, Opcode::UnaryPositive),
    (11, Opcode::UnaryNegative),
    (12, Opcode::UnaryNot),
    (15, Opcode::UnaryInvert),
    (19, Opcode::BinaryPower),
    (20, Opcode::BinaryMultiply),
    (22, Opcode::BinaryModulo),
    (23, Opcode::BinaryAdd),
    (24, Opcode::BinarySubtract),
    (25, Opcode::BinarySubscr),
    (26, Opcode::BinaryFloorDivide),
    (27, Opcode::BinaryTrueDivide),
    (28, Opcode::InplaceFloorDivide),
    (29, Opcode::InplaceTrueDivide),
    (54, Opcode::StoreMap),
    (55, Opcode::InplaceAdd),
    (56, Opcode::InplaceSubtract),
    (57, Opcode::InplaceMultiply),
    (59, Opcode::InplaceModulo),
    (60, Opcode::StoreSubscr),
    (62, Opcode::BinaryLshift),
    (63, Opcode::BinaryRshift),
    (64, Opcode::BinaryAnd),
    (65, Opcode::BinaryXor),
    (66, Opcode::BinaryOr),
    (68, Opcode::GetIter),
    (80, Opcode::BreakLoop),
    (83, Opcode::ReturnValue),
    (87, Opcode::PopBlock),
    (88, Opcode::EndFinally),
    (89, Opcode::PopExcept),
    (90, Opcode::StoreName),
    (91, Opcode::DeleteName),
    (92, Opcode::UnpackSequence),
    (93, Opcode::ForIter),
    (95, Opcode::StoreAttr),
    (97, Opcode::StoreGlobal),
    (100, Opcode::LoadConst),
    (101, Opcode::LoadName),
    (102, Opcode::BuildTuple),
    (103, Opcode::BuildList),
    (105, Opcode::BuildMap),
    (106, Opcode::LoadAttr),
    (107, Opcode::CompareOp),
    (110, Opcode::JumpForward),
    (111, Opcode::JumpIfFalseOrPop),
    (112, Opcode::JumpIfTrueOrPop),
    (113, Opcode::JumpAbsolute),
    (114, Opcode::PopJumpIfFalse),
    (115, Opcode::PopJumpIfTrue),
    (116, Opcode::LoadGlobal),
    (119, Opcode::ContinueLoop),
    (120, Opcode::SetupLoop),
    (121, Opcode::SetupExcept),
    (122, Opcode::SetupFinally),
    (124, Opcode::LoadFast),
    (125, Opcode::StoreFast),
    (126, Opcode::DeleteFast),
    (130, Opcode::RaiseVarargs),
    (131, Opcode::CallFunction),
    (132, Opcode::MakeFunction),
    (134, Opcode::MakeClosure),
    (135, Opcode::LoadClosure),
    (136, Opcode::LoadDeref),
    (137, Opcode::StoreDeref),
    (145, Opcode::ListAppend),
];

// Wordcode shares the Classic numbering and adds these
const WORDCODE_EXTRA: &[(u8, Opcode)] = &[
    (0, Opcode::Cache),
    (144, Opcode::ExtendedArg),
    (151, Opcode::Resume),
    (156, Opcode::BinaryOp),
    (157, Opcode::Copy),
    (158, Opcode::Swap),
    (166, Opcode::Precall),
    (171, Opcode::Call),
    (172, Opcode::LoadFastLoadFast),
];

/// Version of the instruction encoding a code unit was produced for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InstructionSet {
    /// One opcode byte, followed by a little-endian u16 operand when the opcode is >= 90
    #[default]
    Classic,
    /// Two-byte units of opcode and operand, widened by EXTENDED_ARG prefixes
    Wordcode,
}

impl InstructionSet {
    fn entries(&self) -> impl Iterator<Item = &'static (u8, Opcode)> {
        let extra: &'static [(u8, Opcode)] = match self {
            InstructionSet::Classic => &[],
            InstructionSet::Wordcode => WORDCODE_EXTRA,
        };
        CLASSIC_TABLE.iter().chain(extra.iter())
    }

    fn table(&self) -> &'static [Option<Opcode>; 256] {
        static CLASSIC: OnceLock<[Option<Opcode>; 256]> = OnceLock::new();
        static WORDCODE: OnceLock<[Option<Opcode>; 256]> = OnceLock::new();

        let cell = match self {
            InstructionSet::Classic => &CLASSIC,
            InstructionSet::Wordcode => &WORDCODE,
        };
        cell.get_or_init(|| {
            let mut table = [None; 256];
            for &(byte, op) in self.entries() {
                table[byte as usize] = Some(op);
            }
            table
        })
    }

    /// Map an opcode byte to its instruction, if this version defines one
    pub fn opcode(&self, byte: u8) -> Option<Opcode> {
        self.table()[byte as usize]
    }

    /// Byte that encodes `op` in this version
    pub fn encode(&self, op: Opcode) -> Option<u8> {
        self.entries()
            .find(|(_, candidate)| *candidate == op)
            .map(|(byte, _)| *byte)
    }

    /// Whether an instruction with this opcode byte carries an operand
    pub fn has_operand(&self, byte: u8) -> bool {
        match self {
            InstructionSet::Classic => byte >= HAVE_ARGUMENT,
            InstructionSet::Wordcode => true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InstructionSet::Classic => "classic",
            InstructionSet::Wordcode => "wordcode",
        }
    }
}
