//! Geometry and 3x3 projection matrices handed to the renderer

/// Placement of a surface on the canvas, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Row-major 3x3 matrix
pub type Matrix = [f32; 9];

pub const IDENTITY: Matrix = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

pub fn multiply(a: &Matrix, b: &Matrix) -> Matrix {
    let mut out = [0.0; 9];
    for row in 0..3 {
        for col in 0..3 {
            out[row * 3 + col] = (0..3).map(|k| a[row * 3 + k] * b[k * 3 + col]).sum();
        }
    }
    out
}

/// Maps pixel coordinates of a `width` x `height` target (origin top-left)
/// onto normalized device coordinates.
pub fn projection(width: u32, height: u32) -> Matrix {
    let w = width.max(1) as f32;
    let h = height.max(1) as f32;
    [2.0 / w, 0.0, -1.0, 0.0, -2.0 / h, 1.0, 0.0, 0.0, 1.0]
}

/// Matrix that stretches the unit quad over `region`, then applies `projection`
pub fn project_box(region: &Rectangle, projection: &Matrix) -> Matrix {
    let placement = [
        region.width as f32,
        0.0,
        region.x as f32,
        0.0,
        region.height as f32,
        region.y as f32,
        0.0,
        0.0,
        1.0,
    ];
    multiply(projection, &placement)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_maps(m: &Matrix, from: (f32, f32), to: (f32, f32)) {
        let x = m[0] * from.0 + m[1] * from.1 + m[2];
        let y = m[3] * from.0 + m[4] * from.1 + m[5];
        assert!(
            (x - to.0).abs() < 1e-5 && (y - to.1).abs() < 1e-5,
            "{:?} mapped to ({}, {}), expected {:?}",
            from,
            x,
            y,
            to
        );
    }

    #[test]
    fn test_identity() {
        let m = [2.0, 0.0, 1.0, 0.0, 3.0, 4.0, 0.0, 0.0, 1.0];
        assert_eq!(multiply(&IDENTITY, &m), m);
        assert_eq!(multiply(&m, &IDENTITY), m);
    }

    #[test]
    fn test_full_screen_box_covers_ndc() {
        let proj = projection(1920, 1080);
        let m = project_box(&Rectangle::new(0, 0, 1920, 1080), &proj);

        assert_maps(&m, (0.0, 0.0), (-1.0, 1.0));
        assert_maps(&m, (1.0, 1.0), (1.0, -1.0));
    }

    #[test]
    fn test_offset_box() {
        let proj = projection(200, 100);
        let m = project_box(&Rectangle::new(100, 50, 100, 50), &proj);

        assert_maps(&m, (0.0, 0.0), (0.0, 0.0));
        assert_maps(&m, (1.0, 1.0), (1.0, -1.0));
    }
}
