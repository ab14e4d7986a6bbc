mod frame;

pub use frame::{
    ClientFrame, ColumnsMeta, CompletePayload, DEFAULT_MAX_FRAME_SIZE, ErrorPayload,
    FrameDecodeError, MetadataPayload, RowPayload, ServerFrame, StatusPayload,
    decode_client_frame,
};
