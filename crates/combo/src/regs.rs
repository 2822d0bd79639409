use tock_registers::{LocalRegisterCopy, fields::FieldValue, register_bitfields};

use crate::{
    info::{BuildTime, DeviceInfo},
    mmio::RegisterIo,
};

/// Identification and revision word.
pub const ID_REVISION: usize = 0x00;
/// Firmware build timestamp, packed (see [`BuildTime`]).
pub const BUILD_TIME: usize = 0x04;
/// Raised interrupt causes.
pub const INT_RAISED: usize = 0x40;
/// Interrupt enable mask.
pub const INT_ENABLE: usize = 0x44;
/// Writing a cause here raises it (self-test).
pub const INT_RAISE: usize = 0x60;
/// Writing a cause here acknowledges it.
pub const INT_ACK: usize = 0x64;
pub const DMA_SRC: usize = 0x80;
pub const DMA_DST: usize = 0x84;
pub const DMA_COUNT: usize = 0x88;
pub const DMA_CMD: usize = 0x8c;

/// Smallest window that covers every register above.
pub const WINDOW_LEN: usize = 0x100;

register_bitfields![u32,
    pub INTERRUPT [
        DMA OFFSET(8) NUMBITS(1) [],
        SOFTWARE OFFSET(12) NUMBITS(1) []
    ],
    pub DMA_COMMAND [
        RUN OFFSET(0) NUMBITS(1) [],
        SRC OFFSET(1) NUMBITS(3) [
            Host = 2,
            Local = 4
        ],
        DST OFFSET(4) NUMBITS(3) [
            Host = 2,
            Local = 4
        ],
        NO_INTERRUPT OFFSET(7) NUMBITS(1) [],
        STOP OFFSET(31) NUMBITS(1) []
    ]
];

pub type InterruptMask = LocalRegisterCopy<u32, INTERRUPT::Register>;
pub type DmaCommand = LocalRegisterCopy<u32, DMA_COMMAND::Register>;

/// Status value reported by the card when a DMA transfer has completed.
pub const DMA_COMPLETE_CODE: u32 = 1 << 8;
/// Status value of the software (self-test) interrupt.
pub const SOFTWARE_CODE: u32 = 1 << 12;

/// Builds a raw register value out of a combination of field values.
pub fn compose<R: tock_registers::RegisterLongName>(fields: FieldValue<u32, R>) -> u32 {
    let mut reg = LocalRegisterCopy::<u32, R>::new(0);
    reg.modify(fields);
    reg.get()
}

/// Typed accessor over the mapped register window.
pub struct ComboRegisters<R: RegisterIo> {
    io: R,
}

impl<R: RegisterIo> ComboRegisters<R> {
    pub fn new(io: R) -> Self {
        debug_assert!(io.len() >= WINDOW_LEN);
        Self { io }
    }

    pub fn io(&self) -> &R {
        &self.io
    }

    pub fn into_inner(self) -> R {
        self.io
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            id_revision: self.io.read_u32(ID_REVISION),
            build: BuildTime::from_raw(self.io.read_u32(BUILD_TIME)),
        }
    }

    pub fn enable_interrupts(&self, mask: u32) {
        self.io.write_u32(INT_ENABLE, mask);
    }

    pub fn disable_interrupts(&self) {
        self.io.write_u32(INT_ENABLE, 0);
    }

    pub fn interrupt_enable(&self) -> InterruptMask {
        InterruptMask::new(self.io.read_u32(INT_ENABLE))
    }

    /// Reads the raised-interrupt status word.
    pub fn status(&self) -> u32 {
        self.io.read_u32(INT_RAISED)
    }

    pub fn acknowledge(&self, code: u32) {
        self.io.write_u32(INT_ACK, code);
    }

    /// Raises an interrupt cause from the host side (self-test).
    pub fn raise(&self, code: u32) {
        self.io.write_u32(INT_RAISE, code);
    }

    /// Programs one transfer. The command word is written last since it
    /// starts the engine.
    pub fn program_dma(&self, src: u32, dst: u32, len: u32, cmd: u32) {
        self.io.write_u32(DMA_SRC, src);
        self.io.write_u32(DMA_DST, dst);
        self.io.write_u32(DMA_COUNT, len);
        self.io.write_u32(DMA_CMD, cmd);
    }

    pub fn dma_command(&self) -> DmaCommand {
        DmaCommand::new(self.io.read_u32(DMA_CMD))
    }

    pub fn dma_busy(&self) -> bool {
        self.dma_command().is_set(DMA_COMMAND::RUN)
    }

    /// Clears any residual DMA state.
    pub fn stop_dma(&self) {
        self.io
            .write_u32(DMA_CMD, compose(DMA_COMMAND::STOP::SET));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::EmulatedCard;

    #[test]
    fn command_words_match_the_card_encoding() {
        let to_card = compose(
            DMA_COMMAND::RUN::SET
                + DMA_COMMAND::SRC::Host
                + DMA_COMMAND::DST::Local
                + DMA_COMMAND::NO_INTERRUPT::SET,
        );
        assert_eq!(to_card, 0x1 | (0x1 << 7) | (0x2 << 1) | (0x4 << 4));

        let from_card = compose(
            DMA_COMMAND::RUN::SET + DMA_COMMAND::SRC::Local + DMA_COMMAND::DST::Host,
        );
        assert_eq!(from_card, 0x1 | (0x2 << 4) | (0x4 << 1));

        assert_eq!(compose(DMA_COMMAND::STOP::SET), 1 << 31);
        assert_eq!(
            compose(INTERRUPT::DMA::SET + INTERRUPT::SOFTWARE::SET),
            0x1000 | 0x0100
        );
    }

    #[test]
    fn interrupt_registers_round_trip_through_the_card() {
        let card = EmulatedCard::new();
        let regs = ComboRegisters::new(card.clone());

        regs.enable_interrupts(DMA_COMPLETE_CODE | SOFTWARE_CODE);
        assert!(regs.interrupt_enable().is_set(INTERRUPT::DMA));
        assert!(regs.interrupt_enable().is_set(INTERRUPT::SOFTWARE));

        regs.raise(SOFTWARE_CODE);
        assert_eq!(regs.status(), SOFTWARE_CODE);
        regs.acknowledge(SOFTWARE_CODE);
        assert_eq!(regs.status(), 0);

        regs.disable_interrupts();
        assert_eq!(regs.interrupt_enable().get(), 0);
    }

    #[test]
    fn device_info_is_decoded_from_the_id_registers() {
        let card = EmulatedCard::new();
        card.set_identity(0xc058_0104, 0x3a07_1423);
        let info = ComboRegisters::new(card).device_info();
        assert_eq!(info.id_revision, 0xc058_0104);
        assert_eq!(info.build.year, 2003);
        assert_eq!(info.build.month, 10);
        assert_eq!(info.build.day, 7);
        assert_eq!(info.build.hour, 20);
        assert_eq!(info.build.minute, 35);
    }
}
