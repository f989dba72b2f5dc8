//! 小さな整数の最短プッシュ表現 (doginals.js の numberToChunk と同一)。

use bitcoin::opcodes::{self, Opcode};
use bitcoin::opcodes::all::{OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::script::{Builder, Instruction};

/// `n` を最短のプッシュとして追加する。
///
/// 0 は OP_0、1..=16 は OP_1..OP_16、17..128 未満は1バイト、それ以上は2バイトのリトルエンディアン。
pub fn push_number(builder: Builder, n: u16) -> Builder {
    match n {
        0 => builder.push_opcode(opcodes::OP_0),
        1..=16 => builder.push_opcode(small_int_opcode(n as u8)),
        17..=127 => builder.push_slice([n as u8]),
        _ => builder.push_slice(n.to_le_bytes()),
    }
}

/// OP_0 と OP_1..OP_16 だけを数値として読む。それ以外は `None`
pub fn read_small_number(instruction: &Instruction<'_>) -> Option<u8> {
    match instruction {
        Instruction::PushBytes(bytes) if bytes.is_empty() => Some(0),
        Instruction::Op(op) => {
            let code = op.to_u8();
            (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8())
                .contains(&code)
                .then(|| code - OP_PUSHNUM_1.to_u8() + 1)
        }
        _ => None,
    }
}

fn small_int_opcode(n: u8) -> Opcode {
    Opcode::from(OP_PUSHNUM_1.to_u8() + n - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(n: u16) -> Vec<u8> {
        push_number(Builder::new(), n).into_script().into_bytes()
    }

    #[test]
    fn zero_is_op_0() {
        assert_eq!(encode(0), vec![0x00]);
    }

    #[test]
    fn small_ints_use_pushnum_opcodes() {
        assert_eq!(encode(1), vec![0x51]);
        assert_eq!(encode(11), vec![0x5b]);
        assert_eq!(encode(16), vec![0x60]);
    }

    #[test]
    fn single_byte_push_below_128() {
        assert_eq!(encode(17), vec![0x01, 17]);
        assert_eq!(encode(127), vec![0x01, 127]);
    }

    #[test]
    fn two_byte_little_endian_from_128() {
        assert_eq!(encode(128), vec![0x02, 0x80, 0x00]);
        assert_eq!(encode(300), vec![0x02, 0x2c, 0x01]);
    }

    #[test]
    fn reads_back_only_opcode_numbers() {
        for n in 0..=16u16 {
            let script = push_number(Builder::new(), n).into_script();
            let instruction = script.instructions().next().unwrap().unwrap();
            assert_eq!(read_small_number(&instruction), Some(n as u8));
        }

        let script = push_number(Builder::new(), 17).into_script();
        let instruction = script.instructions().next().unwrap().unwrap();
        assert_eq!(read_small_number(&instruction), None);
    }
}
