//! Audio plumbing for the broker: formats, decode/encode helpers and the
//! segment merger.

mod decode;
mod format;
mod merge;
mod mp3;
mod pcm;
mod wav;

pub use decode::{decode_file, probe_duration};
pub use format::AudioFormat;
pub use merge::{AudioMerger, MergeError, MergeReport, MergeStrategy};
pub use mp3::encode_mp3;
pub use pcm::PcmBuffer;
pub use wav::{encode_wav, read_wav};
