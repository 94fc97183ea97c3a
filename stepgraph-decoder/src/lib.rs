//! x86 instruction decoder: wraps `iced_x86`'s decoder and formatter behind
//! a single `decode` entry point, matching one instruction per call against
//! an over-read byte window the caller doesn't need to size precisely.

use iced_x86::{Decoder, DecoderOptions, Formatter, GasFormatter, IntelFormatter};
use thiserror::Error;

/// Mnemonic/operand text flavor, fixed once at startup and threaded through
/// every decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    Intel,
    Att,
}

/// Errors produced while decoding a single instruction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// `iced_x86` flagged the bytes at this address as an invalid or
    /// incomplete encoding.
    #[error("invalid encoding at 0x{address:x}")]
    InvalidEncoding { address: u64 },

    /// Fewer bytes were supplied than the decoder needed to even attempt
    /// decoding (the caller under-read the tracee's memory).
    #[error("buffer too short to decode at 0x{address:x}: {available} bytes available")]
    BufferTooShort { address: u64, available: usize },
}

/// One decoded instruction: its length in bytes and pre-formatted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStep {
    pub address: u64,
    pub len: usize,
    pub mnemonic_text: String,
    pub operand_text: String,
}

impl DecodedStep {
    /// `display_text` as the core consumes it: address, hex bytes, mnemonic
    /// and operands on one line.
    pub fn display_text(&self, bytes: &[u8]) -> String {
        let hex: Vec<String> = bytes[..self.len].iter().map(|b| format!("{b:02x}")).collect();
        format!(
            "0x{:x}  {}  {} {}",
            self.address,
            hex.join(" "),
            self.mnemonic_text,
            self.operand_text
        )
        .trim_end()
        .to_string()
    }
}

/// Decodes x86 machine code in a fixed bitness, formatting instruction text
/// in one syntax flavor for the lifetime of the decoder.
pub struct InstructionDecoder {
    bitness: u32,
    syntax: Syntax,
}

impl InstructionDecoder {
    /// `bitness` is 16, 32, or 64, matching the tracee's execution mode.
    pub fn new(bitness: u32, syntax: Syntax) -> Self {
        Self { bitness, syntax }
    }

    /// Decode exactly one instruction starting at `bytes[0]`. `bytes` may
    /// contain trailing data past the instruction's real end — only
    /// `instruction.len()` of it is consumed.
    pub fn decode(&self, address: u64, bytes: &[u8]) -> Result<DecodedStep, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::BufferTooShort {
                address,
                available: 0,
            });
        }

        let mut decoder = Decoder::with_ip(self.bitness, bytes, address, DecoderOptions::NONE);
        let instruction = decoder.decode();

        if instruction.is_invalid() {
            log::debug!("iced-x86 flagged invalid encoding at 0x{address:x}");
            return Err(DecodeError::InvalidEncoding { address });
        }

        let len = instruction.len();
        let mut mnemonic_text = String::new();
        let mut operand_text = String::new();
        match self.syntax {
            Syntax::Intel => {
                let mut formatter = IntelFormatter::new();
                format_split(&mut formatter, &instruction, &mut mnemonic_text, &mut operand_text);
            }
            Syntax::Att => {
                let mut formatter = GasFormatter::new();
                format_split(&mut formatter, &instruction, &mut mnemonic_text, &mut operand_text);
            }
        }

        Ok(DecodedStep {
            address,
            len,
            mnemonic_text,
            operand_text,
        })
    }
}

/// `iced_x86::Formatter::format` writes mnemonic and operands into one
/// buffer separated by whitespace; split it back apart so `DecodedStep`
/// keeps them as two fields, matching the core's `display_text` shape.
fn format_split(
    formatter: &mut impl Formatter,
    instruction: &iced_x86::Instruction,
    mnemonic_text: &mut String,
    operand_text: &mut String,
) {
    let mut full = String::new();
    formatter.format(instruction, &mut full);
    match full.split_once(' ') {
        Some((mnemonic, operands)) => {
            *mnemonic_text = mnemonic.to_string();
            *operand_text = operands.trim_start().to_string();
        }
        None => *mnemonic_text = full,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_nop_intel() {
        let decoder = InstructionDecoder::new(64, Syntax::Intel);
        let step = decoder.decode(0x1000, &[0x90, 0xcc, 0xcc]).unwrap();
        assert_eq!(step.len, 1);
        assert_eq!(step.mnemonic_text, "nop");
    }

    #[test]
    fn decodes_call_att_with_trailing_garbage() {
        let decoder = InstructionDecoder::new(64, Syntax::Att);
        // call rel32 followed by bytes that belong to the next instruction.
        let step = decoder
            .decode(0x2000, &[0xe8, 0x00, 0x00, 0x00, 0x00, 0x90, 0x90])
            .unwrap();
        assert_eq!(step.len, 5);
    }

    #[test]
    fn empty_buffer_is_too_short() {
        let decoder = InstructionDecoder::new(64, Syntax::Intel);
        let err = decoder.decode(0x3000, &[]).unwrap_err();
        assert!(matches!(err, DecodeError::BufferTooShort { .. }));
    }

    #[test]
    fn invalid_encoding_is_reported() {
        let decoder = InstructionDecoder::new(64, Syntax::Intel);
        // 0x0f 0xff is not a defined opcode.
        let err = decoder.decode(0x4000, &[0x0f, 0xff]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidEncoding { .. }));
    }

    #[test]
    fn display_text_includes_hex_bytes_and_address() {
        let decoder = InstructionDecoder::new(64, Syntax::Intel);
        let bytes = [0x90u8];
        let step = decoder.decode(0x5000, &bytes).unwrap();
        let text = step.display_text(&bytes);
        assert!(text.contains("0x5000"));
        assert!(text.contains("90"));
        assert!(text.contains("nop"));
    }
}
