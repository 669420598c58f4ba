strong_type!(RegionId, u64);
strong_type!(QpNum, u32);
