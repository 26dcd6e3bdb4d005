//! Mapping between the engine's element/reduction types and NCCL's.

use cudarc::nccl::sys;
use tessera::{DataType, ReduceOp};

/// Translate an engine element type into the NCCL data type code.
pub fn to_nccl_dtype(dt: DataType) -> sys::ncclDataType_t {
    use sys::ncclDataType_t as N;
    match dt {
        DataType::F32 => N::ncclFloat32,
        DataType::F64 => N::ncclFloat64,
        DataType::F16 => N::ncclFloat16,
        DataType::BF16 => N::ncclBfloat16,
        DataType::I8 => N::ncclInt8,
        DataType::I32 => N::ncclInt32,
        DataType::I64 => N::ncclInt64,
        DataType::U8 => N::ncclUint8,
        DataType::U32 => N::ncclUint32,
        DataType::U64 => N::ncclUint64,
    }
}

/// Translate an engine reduction op into the NCCL reduction op. The reduce
/// pipeline only ever issues `Sum`; the rest are mapped so the communicator
/// remains a complete backend.
pub fn to_nccl_op(op: ReduceOp) -> sys::ncclRedOp_t {
    use sys::ncclRedOp_t as N;
    match op {
        ReduceOp::Sum => N::ncclSum,
        ReduceOp::Prod => N::ncclProd,
        ReduceOp::Min => N::ncclMin,
        ReduceOp::Max => N::ncclMax,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_DTYPES: [DataType; 10] = [
        DataType::F32,
        DataType::F64,
        DataType::F16,
        DataType::BF16,
        DataType::I8,
        DataType::I32,
        DataType::I64,
        DataType::U8,
        DataType::U32,
        DataType::U64,
    ];

    #[test]
    fn test_dtype_mapping_is_injective() {
        for i in 0..ALL_DTYPES.len() {
            for j in (i + 1)..ALL_DTYPES.len() {
                assert_ne!(
                    to_nccl_dtype(ALL_DTYPES[i]),
                    to_nccl_dtype(ALL_DTYPES[j]),
                    "{} and {} collide",
                    ALL_DTYPES[i],
                    ALL_DTYPES[j]
                );
            }
        }
    }

    #[test]
    fn test_dtype_width_classes_map_as_expected() {
        assert_eq!(to_nccl_dtype(DataType::F64), sys::ncclDataType_t::ncclFloat64);
        assert_eq!(to_nccl_dtype(DataType::F16), sys::ncclDataType_t::ncclFloat16);
        assert_eq!(to_nccl_dtype(DataType::I64), sys::ncclDataType_t::ncclInt64);
        assert_eq!(to_nccl_dtype(DataType::U32), sys::ncclDataType_t::ncclUint32);
    }

    #[test]
    fn test_pipeline_reduction_maps_to_sum() {
        assert_eq!(to_nccl_op(ReduceOp::Sum), sys::ncclRedOp_t::ncclSum);
    }

    #[test]
    fn test_remaining_ops_map_distinctly() {
        let mapped = [
            to_nccl_op(ReduceOp::Sum),
            to_nccl_op(ReduceOp::Prod),
            to_nccl_op(ReduceOp::Min),
            to_nccl_op(ReduceOp::Max),
        ];
        for i in 0..mapped.len() {
            for j in (i + 1)..mapped.len() {
                assert_ne!(mapped[i], mapped[j]);
            }
        }
        assert_eq!(to_nccl_op(ReduceOp::Prod), sys::ncclRedOp_t::ncclProd);
        assert_eq!(to_nccl_op(ReduceOp::Min), sys::ncclRedOp_t::ncclMin);
    }
}
