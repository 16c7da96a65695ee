/// Identity read off an SPI flash memory with the 0x9F command.
///
/// The parts this tool targets answer with three bytes: manufacturer ID,
/// memory type, and a capacity code. No continuation-code handling is
/// attempted; `manufacturer_id` is the first byte as the chip sent it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashId {
    pub manufacturer_id: u8,
    pub memory_type: u8,
    pub capacity: u8,
}

impl FlashId {
    pub fn from_bytes(bytes: [u8; 3]) -> FlashId {
        FlashId {
            manufacturer_id: bytes[0],
            memory_type: bytes[1],
            capacity: bytes[2],
        }
    }

    /// Look up a manufacturer name from the JEDEC ID.
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        match jep106::JEP106Code::new(0, self.manufacturer_id & 0x7F).get() {
            // Winbond acquired NEXCOM and so the ID 0xEF is commonly used for Winbond memory.
            Some(mfn) if mfn == "NEXCOM" => Some("Winbond/NEXCOM"),
            other => other,
        }
    }
}

impl std::fmt::Display for FlashId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mfn = match self.manufacturer_name() {
            Some(mfn) => format!(" ({})", mfn),
            None => "".to_string(),
        };
        write!(f, "Manufacturer 0x{:02X}{}, Type 0x{:02X}, Capacity 0x{:02X}",
               self.manufacturer_id, mfn, self.memory_type, self.capacity)
    }
}
