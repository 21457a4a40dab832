///! Channel/band router - maps every band to one dedicated voice channel

use hfprop_common::{Band, ChannelId};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
pub struct ChannelRouter {
    band_channels: BTreeMap<Band, ChannelId>,
    channel_bands: HashMap<ChannelId, Band>,
}

impl Default for ChannelRouter {
    fn default() -> Self {
        Self::layout(1)
    }
}

impl ChannelRouter {
    /// Assign consecutive channel ids starting at `base`, 160m first.
    /// `None` when the last band's id would overflow.
    pub fn new(base: ChannelId) -> Option<Self> {
        base.checked_add(Band::ALL.len() as ChannelId - 1)?;
        Some(Self::layout(base))
    }

    fn layout(base: ChannelId) -> Self {
        let mut band_channels = BTreeMap::new();
        let mut channel_bands = HashMap::new();

        for (offset, band) in Band::ALL.iter().enumerate() {
            let channel = base + offset as ChannelId;
            band_channels.insert(*band, channel);
            channel_bands.insert(channel, *band);
        }

        Self {
            band_channels,
            channel_bands,
        }
    }

    pub fn band_channel(&self, band: Band) -> Option<ChannelId> {
        self.band_channels.get(&band).copied()
    }

    pub fn channel_band(&self, channel: ChannelId) -> Option<Band> {
        self.channel_bands.get(&channel).copied()
    }

    pub fn is_band_channel(&self, channel: ChannelId) -> bool {
        self.channel_bands.contains_key(&channel)
    }

    /// All (band, channel) pairs in band order
    pub fn channels(&self) -> impl Iterator<Item = (Band, ChannelId)> + '_ {
        self.band_channels.iter().map(|(band, channel)| (*band, *channel))
    }
}
