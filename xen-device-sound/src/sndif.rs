// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Wire layout of the Xen para-virtual sound interface (`sndif`).
//!
//! Only protocol version 2 is spoken: buffer page directories carry no
//! explicit entry count, the count is implied by the page size.

use std::mem::size_of;

use vm_memory::{ByteValued, Le16, Le32, Le64};

pub const XENSND_PROTOCOL_VERSION: u32 = 2;
pub const XENSND_DRIVER_NAME: &str = "vsnd";

pub const XEN_PAGE_SIZE: usize = 4096;

// request operations

pub const XENSND_OP_OPEN: u8 = 0;
pub const XENSND_OP_CLOSE: u8 = 1;
pub const XENSND_OP_READ: u8 = 2;
pub const XENSND_OP_WRITE: u8 = 3;
pub const XENSND_OP_SET_VOLUME: u8 = 4;
pub const XENSND_OP_GET_VOLUME: u8 = 5;
pub const XENSND_OP_MUTE: u8 = 6;
pub const XENSND_OP_UNMUTE: u8 = 7;
pub const XENSND_OP_TRIGGER: u8 = 8;
pub const XENSND_OP_HW_PARAM_QUERY: u8 = 9;

// trigger sub-types

pub const XENSND_OP_TRIGGER_START: u8 = 0;
pub const XENSND_OP_TRIGGER_PAUSE: u8 = 1;
pub const XENSND_OP_TRIGGER_STOP: u8 = 2;
pub const XENSND_OP_TRIGGER_RESUME: u8 = 3;

// events

pub const XENSND_EVT_CUR_POS: u8 = 0;

// PCM formats

pub const XENSND_PCM_FORMAT_S8: u8 = 0;
pub const XENSND_PCM_FORMAT_U8: u8 = 1;
pub const XENSND_PCM_FORMAT_S16_LE: u8 = 2;
pub const XENSND_PCM_FORMAT_S16_BE: u8 = 3;
pub const XENSND_PCM_FORMAT_U16_LE: u8 = 4;
pub const XENSND_PCM_FORMAT_U16_BE: u8 = 5;
pub const XENSND_PCM_FORMAT_S24_LE: u8 = 6;
pub const XENSND_PCM_FORMAT_S24_BE: u8 = 7;
pub const XENSND_PCM_FORMAT_U24_LE: u8 = 8;
pub const XENSND_PCM_FORMAT_U24_BE: u8 = 9;
pub const XENSND_PCM_FORMAT_S32_LE: u8 = 10;
pub const XENSND_PCM_FORMAT_S32_BE: u8 = 11;
pub const XENSND_PCM_FORMAT_U32_LE: u8 = 12;
pub const XENSND_PCM_FORMAT_U32_BE: u8 = 13;
pub const XENSND_PCM_FORMAT_F32_LE: u8 = 14;
pub const XENSND_PCM_FORMAT_F32_BE: u8 = 15;
pub const XENSND_PCM_FORMAT_F64_LE: u8 = 16;
pub const XENSND_PCM_FORMAT_F64_BE: u8 = 17;
pub const XENSND_PCM_FORMAT_IEC958_SUBFRAME_LE: u8 = 18;
pub const XENSND_PCM_FORMAT_IEC958_SUBFRAME_BE: u8 = 19;
pub const XENSND_PCM_FORMAT_MU_LAW: u8 = 20;
pub const XENSND_PCM_FORMAT_A_LAW: u8 = 21;
pub const XENSND_PCM_FORMAT_IMA_ADPCM: u8 = 22;
pub const XENSND_PCM_FORMAT_MPEG: u8 = 23;
pub const XENSND_PCM_FORMAT_GSM: u8 = 24;

// XenStore entries

pub const XENSND_FIELD_UNIQUE_ID: &str = "unique-id";
pub const XENSND_FIELD_TYPE: &str = "type";
pub const XENSND_FIELD_RING_REF: &str = "ring-ref";
pub const XENSND_FIELD_EVT_CHNL: &str = "event-channel";
pub const XENSND_FIELD_EVT_RING_REF: &str = "evt-ring-ref";
pub const XENSND_FIELD_EVT_EVT_CHNL: &str = "evt-event-channel";

pub const XENSND_STREAM_TYPE_PLAYBACK: &str = "p";
pub const XENSND_STREAM_TYPE_CAPTURE: &str = "c";

/// Size of the operation specific payload of requests, responses and events.
pub const XENSND_PAYLOAD_SIZE: usize = 56;

/// Number of grant references a single page directory page holds, given the
/// size of the header preceding the reference array.
pub const fn grefs_per_directory_page(page_size: usize, header_size: usize) -> usize {
    (page_size - header_size) / size_of::<u32>()
}

/// Grant references held by one page of a version 2 page directory.
pub const XENSND_GREFS_PER_DIR_PAGE: usize =
    grefs_per_directory_page(XEN_PAGE_SIZE, size_of::<XenSndPageDirectoryHeader>());

pub const XENSND_IN_RING_OFFS: usize = size_of::<XenSndEventPage>();
pub const XENSND_IN_RING_SIZE: usize = XEN_PAGE_SIZE - XENSND_IN_RING_OFFS;
pub const XENSND_IN_RING_LEN: usize = XENSND_IN_RING_SIZE / size_of::<XenSndEvt>();

/// Request from the frontend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct XenSndReq {
    pub id: Le16,
    pub operation: u8,
    pub reserved: [u8; 5],
    pub payload: [u8; XENSND_PAYLOAD_SIZE],
}

impl Default for XenSndReq {
    fn default() -> Self {
        Self {
            id: 0.into(),
            operation: 0,
            reserved: [0; 5],
            payload: [0; XENSND_PAYLOAD_SIZE],
        }
    }
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for XenSndReq {}

impl XenSndReq {
    pub fn new<T: ByteValued>(id: u16, operation: u8, payload: T) -> Self {
        let mut req = Self {
            id: id.into(),
            operation,
            ..Self::default()
        };
        set_payload(&mut req.payload, &payload);
        req
    }

    /// Interpret the payload as the operation specific request `T`.
    pub fn payload<T: ByteValued + Default>(&self) -> T {
        get_payload(&self.payload)
    }
}

/// Parameters of `XENSND_OP_OPEN`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct XenSndOpenReq {
    pub pcm_rate: Le32,
    pub pcm_format: u8,
    pub pcm_channels: u8,
    pub reserved: Le16,
    /// buffer size in bytes
    pub buffer_sz: Le32,
    /// grant reference of the first page directory page
    pub gref_directory: Le32,
    /// period size in bytes
    pub period_sz: Le32,
}
// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for XenSndOpenReq {}

/// Parameters of `XENSND_OP_READ` and `XENSND_OP_WRITE`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct XenSndRwReq {
    pub offset: Le32,
    pub length: Le32,
}
// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for XenSndRwReq {}

/// Parameters of `XENSND_OP_TRIGGER`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct XenSndTriggerReq {
    pub type_: u8,
}
// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for XenSndTriggerReq {}

/// Closed interval used by hardware parameter queries.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct XenSndRange {
    pub min: Le32,
    pub max: Le32,
}
// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for XenSndRange {}

/// Request and response payload of `XENSND_OP_HW_PARAM_QUERY`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct XenSndQueryHwParam {
    /// bitmask of `1 << XENSND_PCM_FORMAT_*`
    pub formats: Le64,
    pub rates: XenSndRange,
    pub channels: XenSndRange,
    pub buffer: XenSndRange,
    pub period: XenSndRange,
}
// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for XenSndQueryHwParam {}

/// Response to a frontend request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct XenSndResp {
    pub id: Le16,
    pub operation: u8,
    pub reserved: u8,
    /// `0` or a negative errno, stored as its two's complement bits
    pub status: Le32,
    pub payload: [u8; XENSND_PAYLOAD_SIZE],
}

impl Default for XenSndResp {
    fn default() -> Self {
        Self {
            id: 0.into(),
            operation: 0,
            reserved: 0,
            status: 0.into(),
            payload: [0; XENSND_PAYLOAD_SIZE],
        }
    }
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for XenSndResp {}

impl XenSndResp {
    pub fn status(&self) -> i32 {
        i32::from_ne_bytes(u32::from(self.status).to_ne_bytes())
    }

    pub fn set_status(&mut self, status: i32) {
        self.status = u32::from_ne_bytes(status.to_ne_bytes()).into();
    }

    pub fn payload<T: ByteValued + Default>(&self) -> T {
        get_payload(&self.payload)
    }

    pub fn set_payload<T: ByteValued>(&mut self, payload: &T) {
        set_payload(&mut self.payload, payload);
    }
}

/// Payload of `XENSND_EVT_CUR_POS`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct XenSndCurPosEvt {
    /// current position in bytes
    pub position: Le64,
}
// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for XenSndCurPosEvt {}

/// Asynchronous event sent to the frontend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct XenSndEvt {
    pub id: Le16,
    pub type_: u8,
    pub reserved: [u8; 5],
    pub payload: [u8; XENSND_PAYLOAD_SIZE],
}

impl Default for XenSndEvt {
    fn default() -> Self {
        Self {
            id: 0.into(),
            type_: 0,
            reserved: [0; 5],
            payload: [0; XENSND_PAYLOAD_SIZE],
        }
    }
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for XenSndEvt {}

impl XenSndEvt {
    pub fn cur_pos(id: u16, position: u64) -> Self {
        let mut evt = Self {
            id: id.into(),
            type_: XENSND_EVT_CUR_POS,
            ..Self::default()
        };
        set_payload(
            &mut evt.payload,
            &XenSndCurPosEvt {
                position: position.into(),
            },
        );
        evt
    }

    pub fn payload<T: ByteValued + Default>(&self) -> T {
        get_payload(&self.payload)
    }
}

/// Header of the shared page carrying the event ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct XenSndEventPage {
    pub in_cons: Le32,
    pub in_prod: Le32,
    pub reserved: [u8; XENSND_PAYLOAD_SIZE],
}

impl Default for XenSndEventPage {
    fn default() -> Self {
        Self {
            in_cons: 0.into(),
            in_prod: 0.into(),
            reserved: [0; XENSND_PAYLOAD_SIZE],
        }
    }
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for XenSndEventPage {}

/// Header of a buffer page directory page, followed by
/// [`XENSND_GREFS_PER_DIR_PAGE`] grant references.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct XenSndPageDirectoryHeader {
    /// grant reference of the next directory page, `0` terminates the chain
    pub gref_dir_next_page: Le32,
}
// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for XenSndPageDirectoryHeader {}

fn get_payload<T: ByteValued + Default>(payload: &[u8; XENSND_PAYLOAD_SIZE]) -> T {
    let mut val = T::default();
    let len = size_of::<T>().min(XENSND_PAYLOAD_SIZE);
    val.as_mut_slice()[..len].copy_from_slice(&payload[..len]);
    val
}

fn set_payload<T: ByteValued>(payload: &mut [u8; XENSND_PAYLOAD_SIZE], val: &T) {
    let len = size_of::<T>().min(XENSND_PAYLOAD_SIZE);
    payload.fill(0);
    payload[..len].copy_from_slice(&val.as_slice()[..len]);
}
