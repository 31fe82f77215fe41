pub mod jsonl;

/// A line-oriented codec over issue records.
pub trait Codec {
    fn codec_name(&self) -> String;
}
