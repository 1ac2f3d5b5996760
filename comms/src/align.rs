/// Primitive number types whose alignment is at least 8 bytes.
///
/// Receive buffers made of these words can be reinterpreted as any numeric payload of the
/// protocol (`f32` and `u64`) without misaligned casts.
pub trait Align8: bytemuck::Pod {}

impl Align8 for u64 {}
impl Align8 for i64 {}
impl Align8 for f64 {}
impl Align8 for u128 {}
impl Align8 for i128 {}
