use crate::error::FaceIdError;

/// A face detected in an image by the external extractor.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    /// Bounding box as `[x1, y1, x2, y2]` pixel coordinates.
    /// Coordinates may arrive inverted or out of range; consumers
    /// validate before use.
    pub bbox: [f32; 4],

    /// Embedding vector, if the extractor could compute one.
    /// `None` means the face was detected but its quality was too low
    /// to produce a usable embedding.
    pub embedding: Option<Vec<f32>>,
}

/// Detects faces and computes their embedding vectors.
///
/// The input is an encoded image (JPEG, PNG, or a raw camera frame;
/// whatever the implementation was built for). Detection and embedding
/// extraction live outside this crate; the store only consumes results.
///
/// Implementations must be safe for concurrent use.
pub trait FaceExtractor: Send + Sync {
    /// Returns all faces detected in the image. An image with no faces
    /// yields an empty vector, not an error.
    fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>, FaceIdError>;

    /// Returns the dimensionality of the embedding vectors (e.g., 512).
    fn dimension(&self) -> usize;
}

/// Returns the face with the largest valid bounding box among faces that
/// carry an embedding, or `None` if no face qualifies.
///
/// A bounding box is valid when all coordinates are finite and it spans a
/// positive area after normalizing inverted coordinates.
pub fn best_face(faces: &[DetectedFace]) -> Option<&DetectedFace> {
    faces
        .iter()
        .filter(|f| f.embedding.is_some())
        .filter_map(|f| bbox_area(&f.bbox).map(|a| (f, a)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(f, _)| f)
}

/// Area of a bounding box, or `None` if it is malformed.
fn bbox_area(bbox: &[f32; 4]) -> Option<f32> {
    if bbox.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let (mut x1, mut y1, mut x2, mut y2) = (bbox[0], bbox[1], bbox[2], bbox[3]);
    if x2 < x1 {
        std::mem::swap(&mut x1, &mut x2);
    }
    if y2 < y1 {
        std::mem::swap(&mut y1, &mut y2);
    }
    let area = (x2 - x1) * (y2 - y1);
    if area > 0.0 { Some(area) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(bbox: [f32; 4], emb: bool) -> DetectedFace {
        DetectedFace {
            bbox,
            embedding: emb.then(|| vec![1.0, 0.0]),
        }
    }

    #[test]
    fn best_face_picks_largest() {
        let faces = vec![
            face([0.0, 0.0, 10.0, 10.0], true),
            face([0.0, 0.0, 50.0, 50.0], true),
            face([0.0, 0.0, 20.0, 20.0], true),
        ];
        let best = best_face(&faces).unwrap();
        assert_eq!(best.bbox, [0.0, 0.0, 50.0, 50.0]);
    }

    #[test]
    fn best_face_skips_missing_embedding() {
        let faces = vec![
            face([0.0, 0.0, 100.0, 100.0], false),
            face([0.0, 0.0, 10.0, 10.0], true),
        ];
        let best = best_face(&faces).unwrap();
        assert_eq!(best.bbox, [0.0, 0.0, 10.0, 10.0]);
    }

    #[test]
    fn best_face_handles_inverted_bbox() {
        // Inverted coordinates still describe a 40x40 box.
        let faces = vec![
            face([50.0, 50.0, 10.0, 10.0], true),
            face([0.0, 0.0, 5.0, 5.0], true),
        ];
        let best = best_face(&faces).unwrap();
        assert_eq!(best.bbox, [50.0, 50.0, 10.0, 10.0]);
    }

    #[test]
    fn best_face_rejects_degenerate() {
        let faces = vec![
            face([10.0, 10.0, 10.0, 20.0], true),
            face([0.0, 0.0, f32::NAN, 10.0], true),
        ];
        assert!(best_face(&faces).is_none());
    }

    #[test]
    fn best_face_empty() {
        assert!(best_face(&[]).is_none());
    }
}
