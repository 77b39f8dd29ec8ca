// Pasting chart images together.
//
// A vertical stack is as wide as the widest image and as tall as all of them together; a
// horizontal stack is the transpose.  Images are pasted at the top left of their slot and any
// uncovered area is white.

use anyhow::{bail, Result};
use image::{imageops, Rgb, RgbImage};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Vertical,
    Horizontal,
}

pub fn stack_vertical(images: &[RgbImage]) -> RgbImage {
    stack(images, Direction::Vertical)
}

pub fn stack_horizontal(images: &[RgbImage]) -> RgbImage {
    stack(images, Direction::Horizontal)
}

fn stack(images: &[RgbImage], direction: Direction) -> RgbImage {
    let (width, height) = match direction {
        Direction::Vertical => (
            images.iter().map(|i| i.width()).max().unwrap_or(0),
            images.iter().map(|i| i.height()).sum(),
        ),
        Direction::Horizontal => (
            images.iter().map(|i| i.width()).sum(),
            images.iter().map(|i| i.height()).max().unwrap_or(0),
        ),
    };
    let mut canvas = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    let mut offset = 0i64;
    for img in images {
        match direction {
            Direction::Vertical => {
                imageops::replace(&mut canvas, img, 0, offset);
                offset += img.height() as i64;
            }
            Direction::Horizontal => {
                imageops::replace(&mut canvas, img, offset, 0);
                offset += img.width() as i64;
            }
        }
    }
    canvas
}

/// Read the images at `inputs`, stack them, and write the result to `output`.  The format of the
/// output follows its file name.

pub fn combine_files(inputs: &[&Path], output: &Path, direction: Direction) -> Result<()> {
    if inputs.is_empty() {
        bail!("No images to combine into {:?}", output);
    }
    let mut images = vec![];
    for path in inputs {
        images.push(image::open(path)?.to_rgb8());
    }
    let combined = match direction {
        Direction::Vertical => stack_vertical(&images),
        Direction::Horizontal => stack_horizontal(&images),
    };
    combined.save(output)?;
    tracing::debug!(
        "Combined {} images into {:?} ({}x{})",
        images.len(),
        output,
        combined.width(),
        combined.height()
    );
    Ok(())
}

#[cfg(test)]
fn solid(width: u32, height: u32, value: u8) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([value, value, value]))
}

#[test]
fn test_stack_vertical() {
    let img = stack_vertical(&[solid(10, 5, 0), solid(20, 7, 100), solid(15, 3, 0)]);
    assert!(img.width() == 20);
    assert!(img.height() == 15);
    // The narrow first image leaves white to its right.
    assert!(img.get_pixel(5, 2) == &Rgb([0, 0, 0]));
    assert!(img.get_pixel(15, 2) == &Rgb([255, 255, 255]));
    assert!(img.get_pixel(15, 6) == &Rgb([100, 100, 100]));
}

#[test]
fn test_stack_horizontal() {
    let img = stack_horizontal(&[solid(10, 5, 0), solid(20, 7, 100)]);
    assert!(img.width() == 30);
    assert!(img.height() == 7);
    assert!(img.get_pixel(5, 6) == &Rgb([255, 255, 255]));
    assert!(img.get_pixel(12, 6) == &Rgb([100, 100, 100]));
}

#[test]
fn test_combine_files() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.png");
    let b = dir.path().join("b.png");
    solid(8, 4, 10).save(&a).unwrap();
    solid(6, 9, 20).save(&b).unwrap();
    let out = dir.path().join("out.png");
    combine_files(&[a.as_path(), b.as_path()], &out, Direction::Horizontal).unwrap();
    let img = image::open(&out).unwrap();
    assert!(img.width() == 14 && img.height() == 9);
    assert!(combine_files(&[], &out, Direction::Vertical).is_err());
}
