use std::{
    error, fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    ops::RangeInclusive,
};

use log::debug;

const HEADER_LENGTH: usize = 28;
const PAYLOAD_HEADER_LENGTH: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ExchangeType(u8);

impl ExchangeType {
    pub const IKE_SA_INIT: ExchangeType = ExchangeType(34);
    pub const IKE_AUTH: ExchangeType = ExchangeType(35);
    pub const CREATE_CHILD_SA: ExchangeType = ExchangeType(36);
    pub const INFORMATIONAL: ExchangeType = ExchangeType(37);

    pub fn from_u8(value: u8) -> Result<ExchangeType, FormatError> {
        if value >= Self::IKE_SA_INIT.0 && value <= Self::INFORMATIONAL.0 {
            Ok(ExchangeType(value))
        } else {
            debug!("Unsupported IKEv2 Exchange Type {}", value);
            Err("Unsupported IKEv2 Exchange Type".into())
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IKE_SA_INIT => write!(f, "IKE_SA_INIT")?,
            Self::IKE_AUTH => write!(f, "IKE_AUTH")?,
            Self::CREATE_CHILD_SA => write!(f, "CREATE_CHILD_SA")?,
            Self::INFORMATIONAL => write!(f, "INFORMATIONAL")?,
            _ => write!(f, "Unknown exchange type {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const INITIATOR: Flags = Flags(1 << 3);
    pub const VERSION: Flags = Flags(1 << 4);
    pub const RESPONSE: Flags = Flags(1 << 5);

    fn from_u8(value: u8) -> Result<Flags, FormatError> {
        const RESERVED_MASK: u8 =
            0xff & !Flags::INITIATOR.0 & !Flags::VERSION.0 & !Flags::RESPONSE.0;
        if value & RESERVED_MASK != 0x00 {
            debug!("IKEv2 reserved flags are set {}", value & RESERVED_MASK);
            return Err("IKEv2 reserved flags are set".into());
        }
        Ok(Flags(value))
    }

    fn new(initiator: bool, response: bool) -> Flags {
        let mut flags = 0u8;
        if initiator {
            flags |= Flags::INITIATOR.0;
        }
        if response {
            flags |= Flags::RESPONSE.0;
        }
        Flags(flags)
    }

    pub fn has(&self, flag: Flags) -> bool {
        self.0 & flag.0 != 0
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has(Flags::INITIATOR) {
            f.write_str("Initiator")?;
        }
        if self.has(Flags::VERSION) {
            f.write_str("Version")?;
        }
        if self.has(Flags::RESPONSE) {
            f.write_str("Response")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PayloadType(u8);

impl PayloadType {
    pub const NONE: PayloadType = PayloadType(0);
    pub const SECURITY_ASSOCIATION: PayloadType = PayloadType(33);
    pub const KEY_EXCHANGE: PayloadType = PayloadType(34);
    pub const ID_INITIATOR: PayloadType = PayloadType(35);
    pub const ID_RESPONDER: PayloadType = PayloadType(36);
    pub const CERTIFICATE: PayloadType = PayloadType(37);
    pub const CERTIFICATE_REQUEST: PayloadType = PayloadType(38);
    pub const AUTHENTICATION: PayloadType = PayloadType(39);
    pub const NONCE: PayloadType = PayloadType(40);
    pub const NOTIFY: PayloadType = PayloadType(41);
    pub const DELETE: PayloadType = PayloadType(42);
    pub const VENDOR_ID: PayloadType = PayloadType(43);
    pub const TRAFFIC_SELECTOR_INITIATOR: PayloadType = PayloadType(44);
    pub const TRAFFIC_SELECTOR_RESPONDER: PayloadType = PayloadType(45);
    pub const ENCRYPTED_AND_AUTHENTICATED: PayloadType = PayloadType(46);
    pub const CONFIGURATION: PayloadType = PayloadType(47);
    pub const EXTENSIBLE_AUTHENTICATION: PayloadType = PayloadType(48);
    pub const ENCRYPTED_AND_AUTHENTICATED_FRAGMENT: PayloadType = PayloadType(53);

    pub fn from_u8(value: u8) -> PayloadType {
        PayloadType(value)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    fn is_known(&self) -> bool {
        (Self::SECURITY_ASSOCIATION.0..=Self::EXTENSIBLE_AUTHENTICATION.0).contains(&self.0)
            || *self == Self::ENCRYPTED_AND_AUTHENTICATED_FRAGMENT
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "No Next Payload")?,
            Self::SECURITY_ASSOCIATION => write!(f, "Security Association")?,
            Self::KEY_EXCHANGE => write!(f, "Key Exchange")?,
            Self::ID_INITIATOR => write!(f, "Identification - Initiator")?,
            Self::ID_RESPONDER => write!(f, "Identification - Responder")?,
            Self::CERTIFICATE => write!(f, "Certificate")?,
            Self::CERTIFICATE_REQUEST => write!(f, "Certificate Request")?,
            Self::AUTHENTICATION => write!(f, "Authentication")?,
            Self::NONCE => write!(f, "Nonce")?,
            Self::NOTIFY => write!(f, "Notify")?,
            Self::DELETE => write!(f, "Delete")?,
            Self::VENDOR_ID => write!(f, "Vendor ID")?,
            Self::TRAFFIC_SELECTOR_INITIATOR => write!(f, "Traffic Selector - Initiator")?,
            Self::TRAFFIC_SELECTOR_RESPONDER => write!(f, "Traffic Selector - Responder")?,
            Self::ENCRYPTED_AND_AUTHENTICATED => write!(f, "Encrypted and Authenticated")?,
            Self::CONFIGURATION => write!(f, "Configuration")?,
            Self::EXTENSIBLE_AUTHENTICATION => write!(f, "Extensible Authentication")?,
            Self::ENCRYPTED_AND_AUTHENTICATED_FRAGMENT => {
                write!(f, "Encrypted and Authenticated Fragment")?
            }
            _ => write!(f, "Unknown payload type {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ProtocolId(u8);

impl ProtocolId {
    pub const NONE: ProtocolId = ProtocolId(0);
    pub const IKE: ProtocolId = ProtocolId(1);
    pub const AH: ProtocolId = ProtocolId(2);
    pub const ESP: ProtocolId = ProtocolId(3);
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "None")?,
            Self::IKE => write!(f, "IKE")?,
            Self::AH => write!(f, "AH")?,
            Self::ESP => write!(f, "ESP")?,
            _ => write!(f, "Unknown protocol {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NotifyMessageType(u16);

impl NotifyMessageType {
    pub const UNSUPPORTED_CRITICAL_PAYLOAD: NotifyMessageType = NotifyMessageType(1);
    pub const INVALID_IKE_SPI: NotifyMessageType = NotifyMessageType(4);
    pub const INVALID_MAJOR_VERSION: NotifyMessageType = NotifyMessageType(5);
    pub const INVALID_SYNTAX: NotifyMessageType = NotifyMessageType(7);
    pub const INVALID_MESSAGE_ID: NotifyMessageType = NotifyMessageType(9);
    pub const INVALID_SPI: NotifyMessageType = NotifyMessageType(11);
    pub const NO_PROPOSAL_CHOSEN: NotifyMessageType = NotifyMessageType(14);
    pub const INVALID_KE_PAYLOAD: NotifyMessageType = NotifyMessageType(17);
    pub const AUTHENTICATION_FAILED: NotifyMessageType = NotifyMessageType(24);
    pub const SINGLE_PAIR_REQUIRED: NotifyMessageType = NotifyMessageType(34);
    pub const NO_ADDITIONAL_SAS: NotifyMessageType = NotifyMessageType(35);
    pub const INTERNAL_ADDRESS_FAILURE: NotifyMessageType = NotifyMessageType(36);
    pub const FAILED_CP_REQUIRED: NotifyMessageType = NotifyMessageType(37);
    pub const TS_UNACCEPTABLE: NotifyMessageType = NotifyMessageType(38);
    pub const INVALID_SELECTORS: NotifyMessageType = NotifyMessageType(39);
    pub const UNACCEPTABLE_ADDRESSES: NotifyMessageType = NotifyMessageType(40);
    pub const UNEXPECTED_NAT_DETECTED: NotifyMessageType = NotifyMessageType(41);
    pub const TEMPORARY_FAILURE: NotifyMessageType = NotifyMessageType(43);
    pub const CHILD_SA_NOT_FOUND: NotifyMessageType = NotifyMessageType(44);

    pub const INITIAL_CONTACT: NotifyMessageType = NotifyMessageType(16384);
    pub const SET_WINDOW_SIZE: NotifyMessageType = NotifyMessageType(16385);
    pub const ADDITIONAL_TS_POSSIBLE: NotifyMessageType = NotifyMessageType(16386);
    pub const IPCOMP_SUPPORTED: NotifyMessageType = NotifyMessageType(16387);
    pub const NAT_DETECTION_SOURCE_IP: NotifyMessageType = NotifyMessageType(16388);
    pub const NAT_DETECTION_DESTINATION_IP: NotifyMessageType = NotifyMessageType(16389);
    pub const COOKIE: NotifyMessageType = NotifyMessageType(16390);
    pub const USE_TRANSPORT_MODE: NotifyMessageType = NotifyMessageType(16391);
    pub const REKEY_SA: NotifyMessageType = NotifyMessageType(16393);
    pub const MOBIKE_SUPPORTED: NotifyMessageType = NotifyMessageType(16396);
    pub const ADDITIONAL_IP4_ADDRESS: NotifyMessageType = NotifyMessageType(16397);
    pub const ADDITIONAL_IP6_ADDRESS: NotifyMessageType = NotifyMessageType(16398);
    pub const NO_ADDITIONAL_ADDRESSES: NotifyMessageType = NotifyMessageType(16399);
    pub const UPDATE_SA_ADDRESSES: NotifyMessageType = NotifyMessageType(16400);
    pub const COOKIE2: NotifyMessageType = NotifyMessageType(16401);
    pub const NO_NATS_ALLOWED: NotifyMessageType = NotifyMessageType(16402);
    pub const IKEV2_FRAGMENTATION_SUPPORTED: NotifyMessageType = NotifyMessageType(16430);

    pub fn from_u16(value: u16) -> NotifyMessageType {
        NotifyMessageType(value)
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    // RFC 7296, Section 3.10.1: types below 16384 report errors.
    pub fn is_error(&self) -> bool {
        self.0 < 16384
    }
}

impl fmt::Display for NotifyMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNSUPPORTED_CRITICAL_PAYLOAD => write!(f, "UNSUPPORTED_CRITICAL_PAYLOAD")?,
            Self::INVALID_IKE_SPI => write!(f, "INVALID_IKE_SPI")?,
            Self::INVALID_MAJOR_VERSION => write!(f, "INVALID_MAJOR_VERSION")?,
            Self::INVALID_SYNTAX => write!(f, "INVALID_SYNTAX")?,
            Self::INVALID_MESSAGE_ID => write!(f, "INVALID_MESSAGE_ID")?,
            Self::INVALID_SPI => write!(f, "INVALID_SPI")?,
            Self::NO_PROPOSAL_CHOSEN => write!(f, "NO_PROPOSAL_CHOSEN")?,
            Self::INVALID_KE_PAYLOAD => write!(f, "INVALID_KE_PAYLOAD")?,
            Self::AUTHENTICATION_FAILED => write!(f, "AUTHENTICATION_FAILED")?,
            Self::SINGLE_PAIR_REQUIRED => write!(f, "SINGLE_PAIR_REQUIRED")?,
            Self::NO_ADDITIONAL_SAS => write!(f, "NO_ADDITIONAL_SAS")?,
            Self::INTERNAL_ADDRESS_FAILURE => write!(f, "INTERNAL_ADDRESS_FAILURE")?,
            Self::FAILED_CP_REQUIRED => write!(f, "FAILED_CP_REQUIRED")?,
            Self::TS_UNACCEPTABLE => write!(f, "TS_UNACCEPTABLE")?,
            Self::INVALID_SELECTORS => write!(f, "INVALID_SELECTORS")?,
            Self::UNACCEPTABLE_ADDRESSES => write!(f, "UNACCEPTABLE_ADDRESSES")?,
            Self::UNEXPECTED_NAT_DETECTED => write!(f, "UNEXPECTED_NAT_DETECTED")?,
            Self::TEMPORARY_FAILURE => write!(f, "TEMPORARY_FAILURE")?,
            Self::CHILD_SA_NOT_FOUND => write!(f, "CHILD_SA_NOT_FOUND")?,
            Self::INITIAL_CONTACT => write!(f, "INITIAL_CONTACT")?,
            Self::SET_WINDOW_SIZE => write!(f, "SET_WINDOW_SIZE")?,
            Self::ADDITIONAL_TS_POSSIBLE => write!(f, "ADDITIONAL_TS_POSSIBLE")?,
            Self::IPCOMP_SUPPORTED => write!(f, "IPCOMP_SUPPORTED")?,
            Self::NAT_DETECTION_SOURCE_IP => write!(f, "NAT_DETECTION_SOURCE_IP")?,
            Self::NAT_DETECTION_DESTINATION_IP => write!(f, "NAT_DETECTION_DESTINATION_IP")?,
            Self::COOKIE => write!(f, "COOKIE")?,
            Self::USE_TRANSPORT_MODE => write!(f, "USE_TRANSPORT_MODE")?,
            Self::REKEY_SA => write!(f, "REKEY_SA")?,
            Self::MOBIKE_SUPPORTED => write!(f, "MOBIKE_SUPPORTED")?,
            Self::ADDITIONAL_IP4_ADDRESS => write!(f, "ADDITIONAL_IP4_ADDRESS")?,
            Self::ADDITIONAL_IP6_ADDRESS => write!(f, "ADDITIONAL_IP6_ADDRESS")?,
            Self::NO_ADDITIONAL_ADDRESSES => write!(f, "NO_ADDITIONAL_ADDRESSES")?,
            Self::UPDATE_SA_ADDRESSES => write!(f, "UPDATE_SA_ADDRESSES")?,
            Self::COOKIE2 => write!(f, "COOKIE2")?,
            Self::NO_NATS_ALLOWED => write!(f, "NO_NATS_ALLOWED")?,
            Self::IKEV2_FRAGMENTATION_SUPPORTED => write!(f, "IKEV2_FRAGMENTATION_SUPPORTED")?,
            _ => write!(f, "Unknown notify type {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IdType(u8);

impl IdType {
    pub const ID_IPV4_ADDR: IdType = IdType(1);
    pub const ID_FQDN: IdType = IdType(2);
    pub const ID_RFC822_ADDR: IdType = IdType(3);
    pub const ID_IPV6_ADDR: IdType = IdType(5);
    pub const ID_DER_ASN1_DN: IdType = IdType(9);
    pub const ID_KEY_ID: IdType = IdType(11);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notify {
    protocol_id: ProtocolId,
    spi: Vec<u8>,
    message_type: NotifyMessageType,
    data: Vec<u8>,
}

impl Notify {
    pub fn new(message_type: NotifyMessageType, data: &[u8]) -> Notify {
        Notify {
            protocol_id: ProtocolId::NONE,
            spi: vec![],
            message_type,
            data: data.to_vec(),
        }
    }

    pub fn message_type(&self) -> NotifyMessageType {
        self.message_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn decode(data: &[u8]) -> Result<Notify, FormatError> {
        if data.len() < 4 {
            return Err("Not enough data in notify payload".into());
        }
        let spi_size = data[1] as usize;
        if data.len() < 4 + spi_size {
            return Err("Notify SPI exceeds payload length".into());
        }
        Ok(Notify {
            protocol_id: ProtocolId(data[0]),
            spi: data[4..4 + spi_size].to_vec(),
            message_type: NotifyMessageType(read_u16(&data[2..4])),
            data: data[4 + spi_size..].to_vec(),
        })
    }

    fn encode(&self, dest: &mut Vec<u8>) -> Result<(), FormatError> {
        let spi_size = u8::try_from(self.spi.len()).map_err(|_| "Notify SPI is too long")?;
        dest.push(self.protocol_id.0);
        dest.push(spi_size);
        dest.extend_from_slice(&self.message_type.0.to_be_bytes());
        dest.extend_from_slice(&self.spi);
        dest.extend_from_slice(&self.data);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delete {
    protocol_id: ProtocolId,
    spi_size: u8,
    spis: Vec<Vec<u8>>,
}

impl Delete {
    pub fn ike() -> Delete {
        Delete {
            protocol_id: ProtocolId::IKE,
            spi_size: 0,
            spis: vec![],
        }
    }

    pub fn esp(spis: &[u32]) -> Delete {
        Delete {
            protocol_id: ProtocolId::ESP,
            spi_size: 4,
            spis: spis.iter().map(|spi| spi.to_be_bytes().to_vec()).collect(),
        }
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    pub fn esp_spis(&self) -> impl Iterator<Item = u32> + '_ {
        self.spis.iter().filter_map(|spi| {
            let spi: [u8; 4] = spi.as_slice().try_into().ok()?;
            Some(u32::from_be_bytes(spi))
        })
    }

    fn decode(data: &[u8]) -> Result<Delete, FormatError> {
        if data.len() < 4 {
            return Err("Not enough data in delete payload".into());
        }
        let spi_size = data[1];
        let num_spi = read_u16(&data[2..4]) as usize;
        let spi_data = &data[4..];
        if spi_data.len() != num_spi * spi_size as usize {
            return Err("Delete payload SPI list length mismatch".into());
        }
        let spis = if spi_size == 0 {
            vec![]
        } else {
            spi_data
                .chunks(spi_size as usize)
                .map(|spi| spi.to_vec())
                .collect()
        };
        Ok(Delete {
            protocol_id: ProtocolId(data[0]),
            spi_size,
            spis,
        })
    }

    fn encode(&self, dest: &mut Vec<u8>) -> Result<(), FormatError> {
        let num_spi = u16::try_from(self.spis.len()).map_err(|_| "Too many SPIs to delete")?;
        dest.push(self.protocol_id.0);
        dest.push(self.spi_size);
        dest.extend_from_slice(&num_spi.to_be_bytes());
        self.spis.iter().for_each(|spi| dest.extend_from_slice(spi));
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transform {
    transform_type: u8,
    transform_id: u16,
    key_length: Option<u16>,
}

impl Transform {
    pub const ENCRYPTION_ALGORITHM: u8 = 1;
    pub const PSEUDORANDOM_FUNCTION: u8 = 2;
    pub const INTEGRITY_ALGORITHM: u8 = 3;
    pub const KEY_EXCHANGE_METHOD: u8 = 4;
    pub const SEQUENCE_NUMBERS: u8 = 5;

    const ATTRIBUTE_KEY_LENGTH: u16 = 14;
    const ATTRIBUTE_FORMAT_TV: u16 = 0x8000;

    pub fn new(transform_type: u8, transform_id: u16, key_length: Option<u16>) -> Transform {
        Transform {
            transform_type,
            transform_id,
            key_length,
        }
    }

    fn decode(data: &[u8]) -> Result<Transform, FormatError> {
        if data.len() < 8 {
            return Err("Not enough data in transform".into());
        }
        let mut key_length = None;
        let mut attributes = &data[8..];
        while !attributes.is_empty() {
            if attributes.len() < 4 {
                return Err("Not enough data in transform attribute".into());
            }
            let attribute_type = read_u16(&attributes[0..2]);
            if attribute_type & Self::ATTRIBUTE_FORMAT_TV != 0 {
                if attribute_type & !Self::ATTRIBUTE_FORMAT_TV == Self::ATTRIBUTE_KEY_LENGTH {
                    key_length = Some(read_u16(&attributes[2..4]));
                }
                attributes = &attributes[4..];
            } else {
                let length = 4 + read_u16(&attributes[2..4]) as usize;
                if attributes.len() < length {
                    return Err("Transform attribute overflow".into());
                }
                attributes = &attributes[length..];
            }
        }
        Ok(Transform {
            transform_type: data[4],
            transform_id: read_u16(&data[6..8]),
            key_length,
        })
    }

    fn encode(&self, dest: &mut Vec<u8>, last: bool) {
        let length: u16 = if self.key_length.is_some() { 12 } else { 8 };
        dest.push(if last { 0 } else { 3 });
        dest.push(0);
        dest.extend_from_slice(&length.to_be_bytes());
        dest.push(self.transform_type);
        dest.push(0);
        dest.extend_from_slice(&self.transform_id.to_be_bytes());
        if let Some(key_length) = self.key_length {
            let attribute_type = Self::ATTRIBUTE_FORMAT_TV | Self::ATTRIBUTE_KEY_LENGTH;
            dest.extend_from_slice(&attribute_type.to_be_bytes());
            dest.extend_from_slice(&key_length.to_be_bytes());
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    proposal_num: u8,
    protocol_id: ProtocolId,
    spi: Vec<u8>,
    transforms: Vec<Transform>,
}

impl Proposal {
    pub fn new(protocol_id: ProtocolId, transforms: Vec<Transform>) -> Proposal {
        Proposal {
            proposal_num: 1,
            protocol_id,
            spi: vec![],
            transforms,
        }
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    pub fn spi(&self) -> &[u8] {
        &self.spi
    }

    pub fn esp_spi(&self) -> Option<u32> {
        let spi: [u8; 4] = self.spi.as_slice().try_into().ok()?;
        Some(u32::from_be_bytes(spi))
    }

    pub fn with_spi(&self, proposal_num: u8, spi: &[u8]) -> Proposal {
        Proposal {
            proposal_num,
            protocol_id: self.protocol_id,
            spi: spi.to_vec(),
            transforms: self.transforms.clone(),
        }
    }

    pub fn proposal_num(&self) -> u8 {
        self.proposal_num
    }

    // Proposal numbers and SPIs are chosen per message, only the algorithms are compared.
    pub fn matches(&self, other: &Proposal) -> bool {
        self.protocol_id == other.protocol_id && self.transforms == other.transforms
    }

    fn decode(data: &[u8]) -> Result<Proposal, FormatError> {
        if data.len() < 8 {
            return Err("Not enough data in proposal".into());
        }
        let spi_size = data[6] as usize;
        let num_transforms = data[7] as usize;
        if data.len() < 8 + spi_size {
            return Err("Proposal SPI exceeds proposal length".into());
        }
        let mut transforms = Vec::with_capacity(num_transforms);
        let mut transform_data = &data[8 + spi_size..];
        while !transform_data.is_empty() {
            if transform_data.len() < 8 {
                return Err("Not enough data in transform header".into());
            }
            let length = read_u16(&transform_data[2..4]) as usize;
            if length < 8 || length > transform_data.len() {
                return Err("Transform length overflow".into());
            }
            transforms.push(Transform::decode(&transform_data[..length])?);
            transform_data = &transform_data[length..];
        }
        if transforms.len() != num_transforms {
            return Err("Proposal transform count mismatch".into());
        }
        Ok(Proposal {
            proposal_num: data[4],
            protocol_id: ProtocolId(data[5]),
            spi: data[8..8 + spi_size].to_vec(),
            transforms,
        })
    }

    fn encode(&self, dest: &mut Vec<u8>, last: bool) -> Result<(), FormatError> {
        let start = dest.len();
        let spi_size = u8::try_from(self.spi.len()).map_err(|_| "Proposal SPI is too long")?;
        let num_transforms =
            u8::try_from(self.transforms.len()).map_err(|_| "Too many transforms")?;
        dest.push(if last { 0 } else { 2 });
        dest.push(0);
        dest.extend_from_slice(&[0, 0]);
        dest.push(self.proposal_num);
        dest.push(self.protocol_id.0);
        dest.push(spi_size);
        dest.push(num_transforms);
        dest.extend_from_slice(&self.spi);
        for (i, transform) in self.transforms.iter().enumerate() {
            transform.encode(dest, i + 1 == self.transforms.len());
        }
        let length =
            u16::try_from(dest.len() - start).map_err(|_| "Proposal length overflow")?;
        dest[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityAssociation {
    proposals: Vec<Proposal>,
}

impl SecurityAssociation {
    pub fn new(proposals: Vec<Proposal>) -> SecurityAssociation {
        SecurityAssociation { proposals }
    }

    pub fn proposals(&self) -> &[Proposal] {
        &self.proposals
    }

    // Picks the first offered proposal that the local policy accepts.
    pub fn select(&self, supported: &[Proposal]) -> Option<&Proposal> {
        self.proposals
            .iter()
            .find(|offered| supported.iter().any(|local| local.matches(offered)))
    }

    fn decode(data: &[u8]) -> Result<SecurityAssociation, FormatError> {
        let mut proposals = vec![];
        let mut data = data;
        while !data.is_empty() {
            if data.len() < 8 {
                return Err("Not enough data in proposal header".into());
            }
            let length = read_u16(&data[2..4]) as usize;
            if length < 8 || length > data.len() {
                return Err("Proposal length overflow".into());
            }
            proposals.push(Proposal::decode(&data[..length])?);
            data = &data[length..];
        }
        Ok(SecurityAssociation { proposals })
    }

    fn encode(&self, dest: &mut Vec<u8>) -> Result<(), FormatError> {
        for (i, proposal) in self.proposals.iter().enumerate() {
            proposal.encode(dest, i + 1 == self.proposals.len())?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identification {
    id_type: IdType,
    data: Vec<u8>,
}

impl Identification {
    pub fn fqdn(name: &str) -> Identification {
        Identification {
            id_type: IdType::ID_FQDN,
            data: name.as_bytes().to_vec(),
        }
    }

    pub fn id_type(&self) -> IdType {
        self.id_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn to_text(&self) -> String {
        match self.id_type {
            IdType::ID_IPV4_ADDR if self.data.len() == 4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.data);
                Ipv4Addr::from(octets).to_string()
            }
            IdType::ID_IPV6_ADDR if self.data.len() == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.data);
                Ipv6Addr::from(octets).to_string()
            }
            _ => String::from_utf8_lossy(&self.data).into_owned(),
        }
    }

    fn decode(data: &[u8]) -> Result<Identification, FormatError> {
        if data.len() < 4 {
            return Err("Not enough data in identification payload".into());
        }
        Ok(Identification {
            id_type: IdType(data[0]),
            data: data[4..].to_vec(),
        })
    }

    fn encode(&self, dest: &mut Vec<u8>) {
        dest.push(self.id_type.0);
        dest.extend_from_slice(&[0, 0, 0]);
        dest.extend_from_slice(&self.data);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrafficSelector {
    ip_protocol: u8,
    port_range: RangeInclusive<u16>,
    addr_range: RangeInclusive<IpAddr>,
}

impl TrafficSelector {
    const TS_IPV4_ADDR_RANGE: u8 = 7;
    const TS_IPV6_ADDR_RANGE: u8 = 8;

    pub fn from_ip_range(
        addr_range: RangeInclusive<IpAddr>,
    ) -> Result<TrafficSelector, FormatError> {
        match (addr_range.start(), addr_range.end()) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {}
            _ => return Err("Traffic selector address families do not match".into()),
        }
        Ok(TrafficSelector {
            ip_protocol: 0,
            port_range: 0..=u16::MAX,
            addr_range,
        })
    }

    pub fn addr_range(&self) -> &RangeInclusive<IpAddr> {
        &self.addr_range
    }

    fn decode_list(data: &[u8]) -> Result<Vec<TrafficSelector>, FormatError> {
        if data.len() < 4 {
            return Err("Not enough data in traffic selector payload".into());
        }
        let count = data[0] as usize;
        let mut selectors = Vec::with_capacity(count);
        let mut data = &data[4..];
        while !data.is_empty() {
            if data.len() < 8 {
                return Err("Not enough data in traffic selector".into());
            }
            let ts_type = data[0];
            let length = read_u16(&data[2..4]) as usize;
            let addr_len = match ts_type {
                Self::TS_IPV4_ADDR_RANGE => 4,
                Self::TS_IPV6_ADDR_RANGE => 16,
                _ => {
                    debug!("Unsupported traffic selector type {}", ts_type);
                    return Err("Unsupported traffic selector type".into());
                }
            };
            if length != 8 + addr_len * 2 || data.len() < length {
                return Err("Traffic selector length mismatch".into());
            }
            let start_addr = read_ip(&data[8..8 + addr_len]);
            let end_addr = read_ip(&data[8 + addr_len..8 + addr_len * 2]);
            selectors.push(TrafficSelector {
                ip_protocol: data[1],
                port_range: read_u16(&data[4..6])..=read_u16(&data[6..8]),
                addr_range: start_addr..=end_addr,
            });
            data = &data[length..];
        }
        if selectors.len() != count {
            return Err("Traffic selector count mismatch".into());
        }
        Ok(selectors)
    }

    fn encode_list(
        selectors: &[TrafficSelector],
        dest: &mut Vec<u8>,
    ) -> Result<(), FormatError> {
        let count = u8::try_from(selectors.len()).map_err(|_| "Too many traffic selectors")?;
        dest.push(count);
        dest.extend_from_slice(&[0, 0, 0]);
        for ts in selectors {
            let (ts_type, length) = match ts.addr_range.start() {
                IpAddr::V4(_) => (Self::TS_IPV4_ADDR_RANGE, 16u16),
                IpAddr::V6(_) => (Self::TS_IPV6_ADDR_RANGE, 40u16),
            };
            dest.push(ts_type);
            dest.push(ts.ip_protocol);
            dest.extend_from_slice(&length.to_be_bytes());
            dest.extend_from_slice(&ts.port_range.start().to_be_bytes());
            dest.extend_from_slice(&ts.port_range.end().to_be_bytes());
            write_ip(dest, ts.addr_range.start());
            write_ip(dest, ts.addr_range.end());
        }
        Ok(())
    }
}

impl fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} ports {}-{} protocol {}",
            self.addr_range.start(),
            self.addr_range.end(),
            self.port_range.start(),
            self.port_range.end(),
            self.ip_protocol
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    SecurityAssociation(SecurityAssociation),
    Nonce(Vec<u8>),
    IdInitiator(Identification),
    IdResponder(Identification),
    Notify(Notify),
    Delete(Delete),
    TrafficSelectorInitiator(Vec<TrafficSelector>),
    TrafficSelectorResponder(Vec<TrafficSelector>),
    Generic(PayloadType, bool, Vec<u8>),
}

impl Payload {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Self::SecurityAssociation(_) => PayloadType::SECURITY_ASSOCIATION,
            Self::Nonce(_) => PayloadType::NONCE,
            Self::IdInitiator(_) => PayloadType::ID_INITIATOR,
            Self::IdResponder(_) => PayloadType::ID_RESPONDER,
            Self::Notify(_) => PayloadType::NOTIFY,
            Self::Delete(_) => PayloadType::DELETE,
            Self::TrafficSelectorInitiator(_) => PayloadType::TRAFFIC_SELECTOR_INITIATOR,
            Self::TrafficSelectorResponder(_) => PayloadType::TRAFFIC_SELECTOR_RESPONDER,
            Self::Generic(payload_type, _, _) => *payload_type,
        }
    }

    pub fn is_critical(&self) -> bool {
        match self {
            Self::Generic(_, critical, _) => *critical,
            _ => false,
        }
    }

    fn decode(
        payload_type: PayloadType,
        critical: bool,
        data: &[u8],
    ) -> Result<Payload, FormatError> {
        Ok(match payload_type {
            PayloadType::SECURITY_ASSOCIATION => {
                Self::SecurityAssociation(SecurityAssociation::decode(data)?)
            }
            PayloadType::NONCE => Self::Nonce(data.to_vec()),
            PayloadType::ID_INITIATOR => Self::IdInitiator(Identification::decode(data)?),
            PayloadType::ID_RESPONDER => Self::IdResponder(Identification::decode(data)?),
            PayloadType::NOTIFY => Self::Notify(Notify::decode(data)?),
            PayloadType::DELETE => Self::Delete(Delete::decode(data)?),
            PayloadType::TRAFFIC_SELECTOR_INITIATOR => {
                Self::TrafficSelectorInitiator(TrafficSelector::decode_list(data)?)
            }
            PayloadType::TRAFFIC_SELECTOR_RESPONDER => {
                Self::TrafficSelectorResponder(TrafficSelector::decode_list(data)?)
            }
            _ => Self::Generic(payload_type, critical, data.to_vec()),
        })
    }

    fn encode_body(&self, dest: &mut Vec<u8>) -> Result<(), FormatError> {
        match self {
            Self::SecurityAssociation(sa) => sa.encode(dest)?,
            Self::Nonce(nonce) => dest.extend_from_slice(nonce),
            Self::IdInitiator(id) | Self::IdResponder(id) => id.encode(dest),
            Self::Notify(notify) => notify.encode(dest)?,
            Self::Delete(delete) => delete.encode(dest)?,
            Self::TrafficSelectorInitiator(ts) | Self::TrafficSelectorResponder(ts) => {
                TrafficSelector::encode_list(ts, dest)?
            }
            Self::Generic(_, _, data) => dest.extend_from_slice(data),
        }
        Ok(())
    }
}

/// A decoded IKEv2 message: immutable once decoded, built up payload by payload when sending.
#[derive(Clone)]
pub struct Message {
    initiator_spi: u64,
    responder_spi: u64,
    exchange_type: ExchangeType,
    flags: Flags,
    message_id: u32,
    source: SocketAddr,
    destination: SocketAddr,
    payloads: Vec<Payload>,
}

// Parse and validate as described in RFC 7296, Section 3.
impl Message {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initiator_spi: u64,
        responder_spi: u64,
        exchange_type: ExchangeType,
        original_initiator: bool,
        response: bool,
        message_id: u32,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Message {
        Message {
            initiator_spi,
            responder_spi,
            exchange_type,
            flags: Flags::new(original_initiator, response),
            message_id,
            source,
            destination,
            payloads: vec![],
        }
    }

    pub fn decode(
        data: &[u8],
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Result<Message, FormatError> {
        if data.len() < HEADER_LENGTH {
            debug!("Not enough data in message");
            return Err("Not enough data in message".into());
        }
        let initiator_spi = read_u64(&data[0..8]);
        if initiator_spi == 0 {
            debug!("Empty initiator SPI");
            return Err("Empty initiator SPI".into());
        }
        let major_version = data[17] >> 4 & 0x0f;
        if major_version != 2 {
            debug!(
                "Unsupported major version {}.{}",
                major_version,
                data[17] & 0x0f
            );
            return Err("Unsupported major version".into());
        }
        let exchange_type = ExchangeType::from_u8(data[18])?;
        let flags = Flags::from_u8(data[19])?;
        let length = read_u32(&data[24..28]) as usize;
        if data.len() != length {
            debug!(
                "Packet length mismatch (received {} bytes, header specified {} bytes)",
                data.len(),
                length
            );
            return Err("Packet length mismatch".into());
        }

        let mut payloads = vec![];
        let mut next_payload = PayloadType(data[16]);
        let mut remaining = &data[HEADER_LENGTH..];
        while next_payload != PayloadType::NONE {
            if remaining.len() < PAYLOAD_HEADER_LENGTH {
                return Err("Not enough data in payload header".into());
            }
            let payload_length = read_u16(&remaining[2..4]) as usize;
            if payload_length < PAYLOAD_HEADER_LENGTH || payload_length > remaining.len() {
                debug!(
                    "Payload {} length {} exceeds available {} bytes",
                    next_payload,
                    payload_length,
                    remaining.len()
                );
                return Err("Payload length overflow".into());
            }
            let critical = remaining[1] & 0x80 != 0;
            let body = &remaining[PAYLOAD_HEADER_LENGTH..payload_length];
            payloads.push(Payload::decode(next_payload, critical, body)?);
            next_payload = PayloadType(remaining[0]);
            remaining = &remaining[payload_length..];
        }
        if !remaining.is_empty() {
            return Err("Unexpected data after last payload".into());
        }

        Ok(Message {
            initiator_spi,
            responder_spi: read_u64(&data[8..16]),
            exchange_type,
            flags,
            message_id: read_u32(&data[20..24]),
            source,
            destination,
            payloads,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut data = Vec::with_capacity(HEADER_LENGTH + 256);
        data.extend_from_slice(&self.initiator_spi.to_be_bytes());
        data.extend_from_slice(&self.responder_spi.to_be_bytes());
        data.push(
            self.payloads
                .first()
                .map(|payload| payload.payload_type().0)
                .unwrap_or(PayloadType::NONE.0),
        );
        data.push(2 << 4);
        data.push(self.exchange_type.0);
        data.push(self.flags.0);
        data.extend_from_slice(&self.message_id.to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, 0]);

        for (i, payload) in self.payloads.iter().enumerate() {
            let start = data.len();
            let next_payload = self
                .payloads
                .get(i + 1)
                .map(|payload| payload.payload_type().0)
                .unwrap_or(PayloadType::NONE.0);
            data.push(next_payload);
            data.push(if payload.is_critical() { 0x80 } else { 0x00 });
            data.extend_from_slice(&[0, 0]);
            payload.encode_body(&mut data)?;
            let length = u16::try_from(data.len() - start).map_err(|_| "Payload is too long")?;
            data[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
        }

        let length = u32::try_from(data.len()).map_err(|_| "Message is too long")?;
        data[24..28].copy_from_slice(&length.to_be_bytes());
        Ok(data)
    }

    pub fn initiator_spi(&self) -> u64 {
        self.initiator_spi
    }

    pub fn responder_spi(&self) -> u64 {
        self.responder_spi
    }

    pub fn exchange_type(&self) -> ExchangeType {
        self.exchange_type
    }

    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Message was sent by the original initiator of the IKE SA.
    pub fn is_from_initiator(&self) -> bool {
        self.flags.has(Flags::INITIATOR)
    }

    pub fn is_response(&self) -> bool {
        self.flags.has(Flags::RESPONSE)
    }

    pub fn is_request(&self) -> bool {
        !self.is_response()
    }

    pub fn add_payload(&mut self, payload: Payload) {
        self.payloads.push(payload)
    }

    pub fn add_notify(&mut self, message_type: NotifyMessageType, data: &[u8]) {
        self.payloads
            .push(Payload::Notify(Notify::new(message_type, data)))
    }

    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    pub fn payload(&self, payload_type: PayloadType) -> Option<&Payload> {
        self.payloads
            .iter()
            .find(|payload| payload.payload_type() == payload_type)
    }

    pub fn has_payload(&self, payload_type: PayloadType) -> bool {
        self.payload(payload_type).is_some()
    }

    pub fn iter_notify(&self) -> impl Iterator<Item = &Notify> {
        self.payloads.iter().filter_map(|payload| match payload {
            Payload::Notify(notify) => Some(notify),
            _ => None,
        })
    }

    pub fn notify(&self, message_type: NotifyMessageType) -> Option<&Notify> {
        self.iter_notify()
            .find(|notify| notify.message_type() == message_type)
    }

    pub fn unsupported_critical_payload(&self) -> Option<PayloadType> {
        self.payloads
            .iter()
            .find(|payload| payload.is_critical() && !payload.payload_type().is_known())
            .map(|payload| payload.payload_type())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Message {} ID {} SPI {:x}-{:x} flags {} from {} to {}",
            self.exchange_type,
            self.message_id,
            self.initiator_spi,
            self.responder_spi,
            self.flags,
            self.source,
            self.destination
        )?;
        for payload in &self.payloads {
            writeln!(
                f,
                "  Payload {} critical {}",
                payload.payload_type(),
                payload.is_critical()
            )?;
            match payload {
                Payload::SecurityAssociation(sa) => {
                    for prop in sa.proposals() {
                        writeln!(
                            f,
                            "    Proposal {} protocol ID {} SPI {:?}",
                            prop.proposal_num, prop.protocol_id, prop.spi
                        )?;
                        for tf in &prop.transforms {
                            writeln!(
                                f,
                                "      Transform type {} ID {} key length {:?}",
                                tf.transform_type, tf.transform_id, tf.key_length
                            )?;
                        }
                    }
                }
                Payload::Notify(notify) => writeln!(
                    f,
                    "    Notify protocol ID {} SPI {:?} type {} value {:?}",
                    notify.protocol_id, notify.spi, notify.message_type, notify.data
                )?,
                Payload::Delete(delete) => writeln!(
                    f,
                    "    Delete protocol ID {} SPIs {:?}",
                    delete.protocol_id, delete.spis
                )?,
                Payload::IdInitiator(id) | Payload::IdResponder(id) => {
                    writeln!(f, "    ID type {:?} value {}", id.id_type, id.to_text())?
                }
                Payload::TrafficSelectorInitiator(ts) | Payload::TrafficSelectorResponder(ts) => {
                    for ts in ts {
                        writeln!(f, "    Traffic selector {}", ts)?;
                    }
                }
                Payload::Nonce(data) | Payload::Generic(_, _, data) => {
                    writeln!(f, "    Data {:?}", data)?
                }
            }
        }
        Ok(())
    }
}

fn read_u16(data: &[u8]) -> u16 {
    let mut result = [0u8; 2];
    result.copy_from_slice(&data[0..2]);
    u16::from_be_bytes(result)
}

fn read_u32(data: &[u8]) -> u32 {
    let mut result = [0u8; 4];
    result.copy_from_slice(&data[0..4]);
    u32::from_be_bytes(result)
}

fn read_u64(data: &[u8]) -> u64 {
    let mut result = [0u8; 8];
    result.copy_from_slice(&data[0..8]);
    u64::from_be_bytes(result)
}

fn read_ip(data: &[u8]) -> IpAddr {
    if data.len() == 4 {
        let mut octets = [0u8; 4];
        octets.copy_from_slice(data);
        IpAddr::V4(Ipv4Addr::from(octets))
    } else {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&data[..16]);
        IpAddr::V6(Ipv6Addr::from(octets))
    }
}

fn write_ip(dest: &mut Vec<u8>, addr: &IpAddr) {
    match addr {
        IpAddr::V4(addr) => dest.extend_from_slice(&addr.octets()),
        IpAddr::V6(addr) => dest.extend_from_slice(&addr.octets()),
    }
}

/// Converts the payload of an ADDITIONAL_IP4_ADDRESS or ADDITIONAL_IP6_ADDRESS notify.
pub fn ip_from_notify(notify: &Notify) -> Option<IpAddr> {
    match (notify.message_type(), notify.data().len()) {
        (NotifyMessageType::ADDITIONAL_IP4_ADDRESS, 4)
        | (NotifyMessageType::ADDITIONAL_IP6_ADDRESS, 16) => Some(read_ip(notify.data())),
        _ => None,
    }
}

#[derive(Debug)]
pub struct FormatError {
    msg: &'static str,
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl error::Error for FormatError {}

impl From<&'static str> for FormatError {
    fn from(msg: &'static str) -> FormatError {
        FormatError { msg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn sample_message() -> Message {
        let mut msg = Message::new(
            0x1122334455667788,
            0,
            ExchangeType::IKE_SA_INIT,
            true,
            false,
            0,
            addr("192.168.0.2:500"),
            addr("192.168.0.1:500"),
        );
        let proposal = Proposal::new(
            ProtocolId::IKE,
            vec![
                Transform::new(Transform::ENCRYPTION_ALGORITHM, 20, Some(256)),
                Transform::new(Transform::PSEUDORANDOM_FUNCTION, 5, None),
                Transform::new(Transform::KEY_EXCHANGE_METHOD, 19, None),
            ],
        );
        msg.add_payload(Payload::SecurityAssociation(SecurityAssociation::new(vec![
            proposal,
        ])));
        msg.add_payload(Payload::Nonce(vec![7u8; 32]));
        msg.add_notify(NotifyMessageType::MOBIKE_SUPPORTED, &[]);
        msg.add_notify(NotifyMessageType::ADDITIONAL_IP4_ADDRESS, &[10, 0, 0, 1]);
        msg.add_payload(Payload::Delete(Delete::esp(&[0x1000, 0x2000])));
        msg.add_payload(Payload::TrafficSelectorInitiator(vec![
            TrafficSelector::from_ip_range(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0))..=IpAddr::V4(Ipv4Addr::new(10, 0, 0, 255)),
            )
            .unwrap(),
        ]));
        msg
    }

    #[test]
    fn decodes_what_was_encoded() {
        let msg = sample_message();
        let data = msg.encode().unwrap();
        let decoded = Message::decode(&data, msg.source(), msg.destination()).unwrap();

        assert_eq!(decoded.exchange_type(), ExchangeType::IKE_SA_INIT);
        assert!(decoded.is_from_initiator());
        assert!(decoded.is_request());
        assert_eq!(decoded.payloads(), msg.payloads());
        let ip = decoded
            .notify(NotifyMessageType::ADDITIONAL_IP4_ADDRESS)
            .and_then(ip_from_notify);
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        match decoded.payload(PayloadType::DELETE) {
            Some(Payload::Delete(delete)) => {
                assert_eq!(delete.esp_spis().collect::<Vec<_>>(), vec![0x1000, 0x2000])
            }
            _ => panic!("missing delete payload"),
        }
    }

    #[test]
    fn rejects_truncated_and_mismatched_messages() {
        let data = sample_message().encode().unwrap();
        let src = addr("192.168.0.2:500");
        let dst = addr("192.168.0.1:500");
        assert!(Message::decode(&data[..20], src, dst).is_err());
        assert!(Message::decode(&data[..data.len() - 1], src, dst).is_err());

        let mut bad_version = data.clone();
        bad_version[17] = 1 << 4;
        assert!(Message::decode(&bad_version, src, dst).is_err());

        let mut reserved_flags = data.clone();
        reserved_flags[19] |= 0x01;
        assert!(Message::decode(&reserved_flags, src, dst).is_err());

        let mut bad_exchange = data;
        bad_exchange[18] = 99;
        assert!(Message::decode(&bad_exchange, src, dst).is_err());
    }

    #[test]
    fn reports_unknown_critical_payloads() {
        let mut msg = sample_message();
        assert_eq!(msg.unsupported_critical_payload(), None);
        msg.add_payload(Payload::Generic(PayloadType::from_u8(200), true, vec![1, 2]));
        let data = msg.encode().unwrap();
        let decoded = Message::decode(&data, msg.source(), msg.destination()).unwrap();
        assert_eq!(
            decoded.unsupported_critical_payload(),
            Some(PayloadType::from_u8(200))
        );
    }

    #[test]
    fn selects_first_acceptable_proposal() {
        let aes = Proposal::new(
            ProtocolId::ESP,
            vec![Transform::new(Transform::ENCRYPTION_ALGORITHM, 20, Some(256))],
        );
        let chacha = Proposal::new(
            ProtocolId::ESP,
            vec![Transform::new(Transform::ENCRYPTION_ALGORITHM, 28, None)],
        );
        let offer = SecurityAssociation::new(vec![
            chacha.with_spi(1, &[0, 0, 1, 0]),
            aes.with_spi(2, &[0, 0, 2, 0]),
        ]);
        let chosen = offer.select(&[aes.clone()]).unwrap();
        assert_eq!(chosen.proposal_num(), 2);
        assert_eq!(chosen.esp_spi(), Some(0x200));
        assert!(offer.select(&[]).is_none());
    }
}
