//! Fixed-layout little-endian encodings for the records that cross process
//! or rank boundaries.
//!
//! | record           | layout                                          |
//! |------------------|-------------------------------------------------|
//! | `SamplingTask`   | index u64, sample count u64, seed u64           |
//! | `TaskResult`     | hit count u64, sample count u64                 |
//! | `PartitionPlan`  | task count u32, total samples u64, tasks        |
//! | reduce frame     | rank u32, value count u32, values u64           |

use crate::partition::{PartitionPlan, SamplingTask};
use crate::task::TaskResult;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("{record} needs {expected} bytes, got {actual}")]
    Length {
        record: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid {record}: {reason}")]
    Invalid {
        record: &'static str,
        reason: String,
    },
}

/// A record with a fixed encoded size.
pub trait FixedRecord: Sized {
    const NAME: &'static str;
    const LEN: usize;

    fn put(&self, buf: &mut BytesMut);

    /// Reads exactly `LEN` bytes from `buf`.
    fn get(buf: &mut &[u8]) -> Result<Self, CodecError>;
}

pub fn encode<R: FixedRecord>(record: &R) -> Bytes {
    let mut buf = BytesMut::with_capacity(R::LEN);
    record.put(&mut buf);
    buf.freeze()
}

pub fn decode<R: FixedRecord>(mut data: &[u8]) -> Result<R, CodecError> {
    check_len(R::NAME, R::LEN, data.len())?;
    R::get(&mut data)
}

fn check_len(record: &'static str, expected: usize, actual: usize) -> Result<(), CodecError> {
    if expected != actual {
        return Err(CodecError::Length {
            record,
            expected,
            actual,
        });
    }
    Ok(())
}

fn invalid(record: &'static str, reason: impl Into<String>) -> CodecError {
    CodecError::Invalid {
        record,
        reason: reason.into(),
    }
}

impl FixedRecord for SamplingTask {
    const NAME: &'static str = "sampling task";
    const LEN: usize = 24;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.index() as u64);
        buf.put_u64_le(self.sample_count());
        buf.put_u64_le(self.seed());
    }

    fn get(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let index = usize::try_from(buf.get_u64_le())
            .map_err(|_| invalid(Self::NAME, "index does not fit usize"))?;
        let sample_count = buf.get_u64_le();
        let seed = buf.get_u64_le();
        if sample_count == 0 {
            return Err(invalid(Self::NAME, "sample count is zero"));
        }
        Ok(SamplingTask::new(index, sample_count, seed))
    }
}

impl FixedRecord for TaskResult {
    const NAME: &'static str = "task result";
    const LEN: usize = 16;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.hit_count());
        buf.put_u64_le(self.sample_count());
    }

    fn get(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let result = TaskResult::new(buf.get_u64_le(), buf.get_u64_le());
        if !result.is_consistent() {
            return Err(invalid(
                Self::NAME,
                format!(
                    "{} hits over {} samples",
                    result.hit_count(),
                    result.sample_count()
                ),
            ));
        }
        Ok(result)
    }
}

fn header_u32(record: &'static str, field: &str, value: usize) -> Result<u32, CodecError> {
    u32::try_from(value).map_err(|_| invalid(record, format!("{} {} does not fit u32", field, value)))
}

/// Encodes a whole plan so it can be shipped to ranks that did not build it.
pub fn encode_plan(plan: &PartitionPlan) -> Result<Bytes, CodecError> {
    let count = header_u32("partition plan", "task count", plan.len())?;
    let mut buf = BytesMut::with_capacity(12 + plan.len() * SamplingTask::LEN);
    buf.put_u32_le(count);
    buf.put_u64_le(plan.total_samples());
    for task in plan.tasks() {
        task.put(&mut buf);
    }
    Ok(buf.freeze())
}

pub fn decode_plan(mut data: &[u8]) -> Result<PartitionPlan, CodecError> {
    const NAME: &str = "partition plan";
    if data.len() < 12 {
        return Err(CodecError::Length {
            record: NAME,
            expected: 12,
            actual: data.len(),
        });
    }
    let count = data.get_u32_le() as usize;
    let total = data.get_u64_le();
    check_len(NAME, 12 + count * SamplingTask::LEN, 12 + data.len())?;

    let mut tasks = Vec::with_capacity(count);
    for _ in 0..count {
        tasks.push(SamplingTask::get(&mut data)?);
    }

    let plan = PartitionPlan::from_tasks(tasks).map_err(|e| invalid(NAME, e.to_string()))?;
    if plan.total_samples() != total {
        return Err(invalid(
            NAME,
            format!(
                "header total {} but tasks sum to {}",
                total,
                plan.total_samples()
            ),
        ));
    }
    Ok(plan)
}

pub fn encode_frame(rank: usize, values: &[u64]) -> Result<Bytes, CodecError> {
    let rank = header_u32("reduce frame", "rank", rank)?;
    let count = header_u32("reduce frame", "value count", values.len())?;
    let mut buf = BytesMut::with_capacity(8 + values.len() * 8);
    buf.put_u32_le(rank);
    buf.put_u32_le(count);
    for &value in values {
        buf.put_u64_le(value);
    }
    Ok(buf.freeze())
}

pub fn decode_frame(mut data: &[u8]) -> Result<(usize, Vec<u64>), CodecError> {
    const NAME: &str = "reduce frame";
    if data.len() < 8 {
        return Err(CodecError::Length {
            record: NAME,
            expected: 8,
            actual: data.len(),
        });
    }
    let rank = data.get_u32_le() as usize;
    let count = data.get_u32_le() as usize;
    check_len(NAME, 8 + count * 8, 8 + data.len())?;

    let values = (0..count).map(|_| data.get_u64_le()).collect();
    Ok((rank, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::plan;

    #[test]
    fn test_task_layout_is_little_endian() {
        let plan = plan(10, 4).unwrap();
        let bytes = encode(&plan.tasks()[1]);
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[0..8], &1u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &3u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &1u64.to_le_bytes());
        assert_eq!(decode::<SamplingTask>(&bytes).unwrap(), plan.tasks()[1]);
    }

    #[test]
    fn test_rejects_wrong_length() {
        let bytes = encode(&TaskResult::new(3, 4));
        assert_eq!(
            decode::<TaskResult>(&bytes[..15]),
            Err(CodecError::Length {
                record: "task result",
                expected: 16,
                actual: 15
            })
        );
    }

    #[test]
    fn test_rejects_inconsistent_result() {
        let bytes = encode(&TaskResult::new(9, 4));
        assert!(matches!(
            decode::<TaskResult>(&bytes),
            Err(CodecError::Invalid { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_sample_task() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&0u64.to_le_bytes());
        raw.extend_from_slice(&0u64.to_le_bytes());
        raw.extend_from_slice(&5u64.to_le_bytes());
        assert!(matches!(
            decode::<SamplingTask>(&raw),
            Err(CodecError::Invalid { .. })
        ));
    }

    #[test]
    fn test_plan_survives_encoding() {
        let plan = plan(1_003, 5).unwrap();
        let bytes = encode_plan(&plan).unwrap();
        assert_eq!(bytes.len(), 12 + 5 * 24);
        assert_eq!(decode_plan(&bytes).unwrap(), plan);
        assert!(decode_plan(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_plan_total_must_match_tasks() {
        let plan = plan(100, 2).unwrap();
        let mut raw = encode_plan(&plan).unwrap().to_vec();
        raw[4..12].copy_from_slice(&99u64.to_le_bytes());
        assert!(matches!(decode_plan(&raw), Err(CodecError::Invalid { .. })));
    }

    #[test]
    fn test_frame_carries_rank_and_values() {
        let frame = encode_frame(3, &[7, 0, u64::MAX]).unwrap();
        assert_eq!(decode_frame(&frame).unwrap(), (3, vec![7, 0, u64::MAX]));
        assert!(decode_frame(&frame[..frame.len() - 8]).is_err());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_frame_rank_beyond_u32_is_rejected() {
        let rank = u32::MAX as usize + 1;
        assert!(matches!(
            encode_frame(rank, &[1]),
            Err(CodecError::Invalid {
                record: "reduce frame",
                ..
            })
        ));
        assert!(encode_frame(u32::MAX as usize, &[1]).is_ok());
    }
}
