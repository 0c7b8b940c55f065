mod collective;
mod frame;
mod local;
mod solo;
mod tcp;

pub use collective::Collective;
pub use frame::{MAX_FRAME_LEN, read_frame, write_frame};
pub use local::LocalGroup;
pub use solo::Solo;
pub use tcp::{Rendezvous, TcpGroup};

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();
