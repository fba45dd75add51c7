/// Shape of a single-image tensor. The batch dimension is always 1.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Shape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Number of spatial positions in a single channel
    #[inline]
    pub fn plane(&self) -> usize {
        self.height * self.width
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.channels * self.plane()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `[1, C, H, W]` dimensions of a tensor with this shape
    pub fn dims(&self) -> [usize; 4] {
        [1, self.channels, self.height, self.width]
    }
}

/// A dense `f32` tensor holding one image or one feature activation, laid out
/// channel by channel, each channel row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
}

impl Tensor {
    pub fn zeros(shape: Shape) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.len()],
        }
    }

    /// Creates a tensor with every element set to `value`
    pub fn full(shape: Shape, value: f32) -> Self {
        Self {
            shape,
            data: vec![value; shape.len()],
        }
    }

    /// Wraps existing data, returning `None` if the data length doesn't match
    /// the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Option<Self> {
        if data.len() == shape.len() {
            Some(Self { shape, data })
        } else {
            None
        }
    }

    /// Creates an image tensor where every pixel has the same RGB value
    pub fn solid(height: usize, width: usize, rgb: [f32; 3]) -> Self {
        let shape = Shape::new(3, height, width);
        let mut data = Vec::with_capacity(shape.len());
        for value in rgb.iter() {
            data.extend(std::iter::repeat(*value).take(shape.plane()));
        }
        Self { shape, data }
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// The `[1, C, H, W]` dimensions of the tensor
    pub fn dims(&self) -> [usize; 4] {
        self.shape.dims()
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// The values of a single channel
    #[inline]
    pub fn channel(&self, c: usize) -> &[f32] {
        let plane = self.shape.plane();
        &self.data[c * plane..(c + 1) * plane]
    }

    #[inline]
    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.shape.height + y) * self.shape.width + x]
    }

    /// Clamps every element into `[min, max]` in place
    pub fn clamp(&mut self, min: f32, max: f32) {
        clamp_slice(&mut self.data, min, max);
    }

    /// Adds `other` element-wise into this tensor
    pub fn add_assign(&mut self, other: &Tensor) {
        debug_assert_eq!(self.shape, other.shape);
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += *b;
        }
    }

    pub fn fill(&mut self, value: f32) {
        for v in &mut self.data {
            *v = value;
        }
    }

    /// Largest absolute element-wise difference to another tensor of the same
    /// shape
    pub fn max_abs_diff(&self, other: &Tensor) -> f32 {
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }
}

pub(crate) fn clamp_slice(data: &mut [f32], min: f32, max: f32) {
    for v in data {
        // NaN stays NaN, which is what we want for the non-finite caveat
        if *v < min {
            *v = min;
        } else if *v > max {
            *v = max;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn solid_layout_is_planar() {
        let t = Tensor::solid(2, 3, [0.1, 0.2, 0.3]);
        assert_eq!(t.dims(), [1, 3, 2, 3]);
        assert!(t.channel(0).iter().all(|v| *v == 0.1));
        assert!(t.channel(2).iter().all(|v| *v == 0.3));
        assert_eq!(t.get(1, 1, 2), 0.2);
    }

    #[test]
    fn clamp_bounds() {
        let mut t = Tensor::from_vec(Shape::new(1, 1, 4), vec![-1.0, 0.5, 1.5, 1.0]).unwrap();
        t.clamp(0.0, 1.0);
        assert_eq!(t.as_slice(), &[0.0, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn from_vec_checks_len() {
        assert!(Tensor::from_vec(Shape::new(3, 2, 2), vec![0.0; 11]).is_none());
    }
}
