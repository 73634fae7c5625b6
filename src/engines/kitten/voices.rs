use std::path::Path;

use super::model::{KittenError, STYLE_DIM};

/// Style vectors for every voice shipped with the model.
///
/// `voices.bin` is a flat little-endian `f32` array of shape `[voices, 256]`.
pub struct VoiceTable {
    styles: Vec<[f32; STYLE_DIM]>,
}

impl VoiceTable {
    pub fn load(path: &Path) -> Result<Self, KittenError> {
        let data = std::fs::read(path)?;
        let table = Self::from_bytes(&data)?;
        log::info!("Loaded {} voices", table.len());
        Ok(table)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, KittenError> {
        if data.len() % 4 != 0 {
            return Err(KittenError::VoiceParse(format!(
                "byte length {} is not a multiple of 4",
                data.len()
            )));
        }
        let floats: Vec<f32> = data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        if floats.is_empty() || floats.len() % STYLE_DIM != 0 {
            return Err(KittenError::VoiceParse(format!(
                "float count {} is not a positive multiple of {STYLE_DIM}",
                floats.len()
            )));
        }

        let styles = floats
            .chunks_exact(STYLE_DIM)
            .map(|chunk| {
                let mut style = [0f32; STYLE_DIM];
                style.copy_from_slice(chunk);
                style
            })
            .collect();
        Ok(Self { styles })
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }

    /// Style vector for `voice_id`. Unknown ids fall back to voice 0.
    pub fn style(&self, voice_id: i32) -> &[f32; STYLE_DIM] {
        usize::try_from(voice_id)
            .ok()
            .and_then(|index| self.styles.get(index))
            .unwrap_or(&self.styles[0])
    }
}

#[cfg(test)]
mod tests {
    use super::VoiceTable;
    use crate::engines::kitten::model::STYLE_DIM;

    fn bytes(voices: usize) -> Vec<u8> {
        (0..voices * STYLE_DIM)
            .flat_map(|i| ((i / STYLE_DIM) as f32).to_le_bytes())
            .collect()
    }

    #[test]
    fn splits_into_voices() {
        let table = VoiceTable::from_bytes(&bytes(3)).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.style(2)[0], 2.0);
        assert_eq!(table.style(1)[STYLE_DIM - 1], 1.0);
    }

    #[test]
    fn out_of_range_voice_falls_back_to_first() {
        let table = VoiceTable::from_bytes(&bytes(2)).unwrap();
        assert_eq!(table.style(7)[0], 0.0);
        assert_eq!(table.style(-1)[0], 0.0);
    }

    #[test]
    fn rejects_partial_vectors() {
        assert!(VoiceTable::from_bytes(&[0u8; 6]).is_err());
        assert!(VoiceTable::from_bytes(&[0u8; 4 * 100]).is_err());
        assert!(VoiceTable::from_bytes(&[]).is_err());
    }
}
