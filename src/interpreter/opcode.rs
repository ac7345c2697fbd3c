//! The opcode byte, one per instruction family documented in §4.7.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    LoadNil = 0,
    LoadBool = 1,
    LoadInt = 2,
    LoadLiteral = 3,
    Move = 4,

    Add = 10,
    Sub = 11,
    Mul = 12,
    Div = 13,
    Mod = 14,

    Eq = 20,
    Lt = 21,
    Le = 22,
    Gt = 23,
    Ge = 24,

    IntToString = 30,

    NewArray = 40,
    NewTuple = 41,
    NewInstance = 42,
    GetField = 43,
    SetField = 44,
    GetElement = 45,
    SetElement = 46,

    CallMethod = 50,
    TailCallMethod = 51,
    InvokeClosure = 52,
    Return = 53,
    ReturnNil = 54,
    Throw = 55,
    MakeClosure = 56,

    Jump = 60,
    JumpIfFalse = 61,
    JumpIfTrue = 62,

    Spawn = 70,
    Send = 71,
    Receive = 72,
    Sleep = 73,

    IoRead = 80,
    IoWrite = 81,

    FfiCall = 90,

    Safepoint = 100,
    Yield = 101,
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        Ok(match byte {
            0 => LoadNil,
            1 => LoadBool,
            2 => LoadInt,
            3 => LoadLiteral,
            4 => Move,
            10 => Add,
            11 => Sub,
            12 => Mul,
            13 => Div,
            14 => Mod,
            20 => Eq,
            21 => Lt,
            22 => Le,
            23 => Gt,
            24 => Ge,
            30 => IntToString,
            40 => NewArray,
            41 => NewTuple,
            42 => NewInstance,
            43 => GetField,
            44 => SetField,
            45 => GetElement,
            46 => SetElement,
            50 => CallMethod,
            51 => TailCallMethod,
            52 => InvokeClosure,
            53 => Return,
            54 => ReturnNil,
            55 => Throw,
            56 => MakeClosure,
            60 => Jump,
            61 => JumpIfFalse,
            62 => JumpIfTrue,
            70 => Spawn,
            71 => Send,
            72 => Receive,
            73 => Sleep,
            80 => IoRead,
            81 => IoWrite,
            90 => FfiCall,
            100 => Safepoint,
            101 => Yield,
            _ => return Err(()),
        })
    }
}
