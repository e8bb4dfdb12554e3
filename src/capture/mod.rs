pub mod afu420;
pub mod assembler;
pub mod jpeg;
pub mod sink;
pub mod stream;

pub use afu420::{check_and_eat_img_header, Afu420Assembler, HeaderLayout};
pub use assembler::{FrameAssembler, FrameOutput};
pub use jpeg::JpegAssembler;
pub use sink::{DeliverThread, Delivery, ImageSink};
pub use stream::{
    CompletionHandler, DeviceLostSignal, StreamEngine, TransferAction, TransferCompletion,
    TransferStatus,
};
