//! BLE advertising payload encoding (supplement, spec §6).
//!
//! Grounded on `ble_adv_data.h`'s two `__attribute__((packed))` structs:
//! [`General`] (service-UUID AD + manufacturer-data AD carrying the
//! OpenSync beacon payload) and [`Proximity`] (a plain iBeacon
//! manufacturer-data AD). Both are little-endian and fixed-size; this
//! module builds the exact byte layout rather than going through a generic
//! TLV encoder, since the AD structure boundaries are part of the contract.

/// AD type: "Complete List of 16-bit Service Class UUIDs".
const AD_TYPE_SERVICE_UUID: u8 = 0x03;
/// AD type: "Manufacturer Specific Data".
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;
/// Fixed version byte for the OpenSync beacon payload.
const BEACON_VERSION: u8 = 0x05;
/// Apple's Bluetooth SIG company identifier, used by both variants.
const COMPANY_ID_APPLE: u16 = 0x004C;
/// iBeacon "Proximity" beacon type.
const IBEACON_BEACON_TYPE: u16 = 0x1502;

/// The general-purpose OpenSync advertising payload: a service-UUID AD
/// structure followed by a manufacturer-data AD structure carrying the
/// beacon version, serial number, message type, and pairing token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct General {
    pub service_uuid: u16,
    pub company_id: u16,
    pub serial_num: [u8; 12],
    pub msg_type: u8,
    pub status: u8,
    pub pairing_token: [u8; 4],
}

impl General {
    /// Encodes the fixed-layout payload: `service` AD (5 bytes) + `mfd` AD
    /// header (4 bytes) + beacon fields (1 + 12 + 1 + 1 + 1 + 4 = 20 bytes),
    /// 28 bytes total, matching spec §6's "total significant bytes ≤ 28".
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(28);

        // service: len=3 (type + 2-byte uuid), type=0x03, uuid (LE)
        buf.push(3);
        buf.push(AD_TYPE_SERVICE_UUID);
        buf.extend_from_slice(&self.service_uuid.to_le_bytes());

        // mfd: len = 1(type) + 2(cid) + 20(beacon data) = 23, type=0xFF, cid (LE)
        buf.push(1 + 2 + 20);
        buf.push(AD_TYPE_MANUFACTURER_DATA);
        buf.extend_from_slice(&self.company_id.to_le_bytes());

        // beacon data
        buf.push(BEACON_VERSION);
        buf.extend_from_slice(&self.serial_num);
        buf.push(self.msg_type);
        buf.push(self.status);
        buf.push(0); // _rfu
        buf.extend_from_slice(&self.pairing_token);

        debug_assert_eq!(buf.len(), 28);
        buf
    }
}

/// The iBeacon-compatible proximity advertising payload: a single
/// manufacturer-data AD structure, exactly 26 bytes of data per spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proximity {
    pub uuid: [u8; 16],
    pub major: u16,
    pub minor: u16,
    pub measured_power: i8,
}

impl Proximity {
    /// Encodes the fixed 26-byte iBeacon manufacturer-data AD structure:
    /// `length`(1) + `type`(1) + `company_id`(2) + `beacon_type`(2) +
    /// `uuid`(16) + `major`(2) + `minor`(2) + `measured_power`(1) = 27
    /// bytes total, of which the trailing 26 (everything after `length`)
    /// are the AD structure's declared length.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(27);
        buf.push(0x1A); // length: 26 bytes follow
        buf.push(AD_TYPE_MANUFACTURER_DATA);
        buf.extend_from_slice(&COMPANY_ID_APPLE.to_le_bytes());
        buf.extend_from_slice(&IBEACON_BEACON_TYPE.to_le_bytes());
        buf.extend_from_slice(&self.uuid); // UUID bytes are transmitted as-is, not byte-swapped
        buf.extend_from_slice(&self.major.to_le_bytes());
        buf.extend_from_slice(&self.minor.to_le_bytes());
        buf.push(self.measured_power as u8);

        debug_assert_eq!(buf.len(), 27);
        debug_assert_eq!(buf[0] as usize, buf.len() - 1);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn general_payload_is_28_bytes_with_expected_ad_headers() {
        let payload = General {
            service_uuid: 0x1234,
            company_id: COMPANY_ID_APPLE,
            serial_num: *b"ABCDEFGHIJKL",
            msg_type: 0,
            status: 7,
            pairing_token: [0xDE, 0xAD, 0xBE, 0xEF],
        };
        let bytes = payload.encode();
        assert_eq!(bytes.len(), 28);
        assert_eq!(bytes[0], 3);
        assert_eq!(bytes[1], AD_TYPE_SERVICE_UUID);
        assert_eq!(&bytes[2..4], &0x1234u16.to_le_bytes());
        assert_eq!(bytes[4], 23);
        assert_eq!(bytes[5], AD_TYPE_MANUFACTURER_DATA);
        assert_eq!(bytes[8], BEACON_VERSION);
        assert_eq!(&bytes[9..21], b"ABCDEFGHIJKL");
        assert_eq!(bytes[21], 0); // msg_type
        assert_eq!(bytes[22], 7); // status
        assert_eq!(bytes[23], 0); // _rfu
        assert_eq!(&bytes[24..28], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn proximity_payload_is_27_bytes_with_ibeacon_header() {
        let payload = Proximity { uuid: [0xAA; 16], major: 1, minor: 2, measured_power: -59 };
        let bytes = payload.encode();
        assert_eq!(bytes.len(), 27);
        assert_eq!(bytes[0], 0x1A);
        assert_eq!(bytes[1], AD_TYPE_MANUFACTURER_DATA);
        assert_eq!(&bytes[2..4], &COMPANY_ID_APPLE.to_le_bytes());
        assert_eq!(&bytes[4..6], &IBEACON_BEACON_TYPE.to_le_bytes());
        assert_eq!(&bytes[6..22], &[0xAA; 16]);
        assert_eq!(&bytes[22..24], &1u16.to_le_bytes());
        assert_eq!(&bytes[24..26], &2u16.to_le_bytes());
        assert_eq!(bytes[26] as i8, -59);
    }
}
