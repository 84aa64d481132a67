use crate::runs::batch::VariationMetrics;

pub const MAX_VARIATIONS: usize = 6;

/// A campaign look the product photo is re-shot in, with the studio figures
/// used to estimate what a generated image saves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CampaignVariation {
    pub name: &'static str,
    pub prompt_suffix: &'static str,
    pub use_case: &'static str,
    pub base_ctr: f64,
    pub base_engagement: f64,
    pub cost_per_hour: f64,
    pub hours_per_shot: f64,
}

impl CampaignVariation {
    pub fn id(&self) -> String {
        self.name.to_ascii_lowercase()
    }

    pub fn cost_saved(&self) -> f64 {
        self.cost_per_hour * self.hours_per_shot
    }

    pub fn metrics(&self) -> VariationMetrics {
        VariationMetrics {
            cost_saved: self.cost_saved(),
            time_saved_hours: self.hours_per_shot,
            predicted_ctr: self.base_ctr,
            engagement_score: self.base_engagement,
        }
    }
}

pub const CAMPAIGN_VARIATIONS: [CampaignVariation; MAX_VARIATIONS] = [
    CampaignVariation {
        name: "Lifestyle",
        prompt_suffix: "lifestyle photography",
        use_case: "Social Media",
        base_ctr: 0.045,
        base_engagement: 8.2,
        cost_per_hour: 75.0,
        hours_per_shot: 3.0,
    },
    CampaignVariation {
        name: "Commercial",
        prompt_suffix: "commercial photography",
        use_case: "E-commerce",
        base_ctr: 0.038,
        base_engagement: 7.8,
        cost_per_hour: 100.0,
        hours_per_shot: 2.0,
    },
    CampaignVariation {
        name: "Editorial",
        prompt_suffix: "editorial photography",
        use_case: "Magazine",
        base_ctr: 0.042,
        base_engagement: 8.5,
        cost_per_hour: 150.0,
        hours_per_shot: 4.0,
    },
    CampaignVariation {
        name: "Minimalist",
        prompt_suffix: "minimalist photography",
        use_case: "Website",
        base_ctr: 0.035,
        base_engagement: 7.2,
        cost_per_hour: 80.0,
        hours_per_shot: 2.5,
    },
    CampaignVariation {
        name: "Luxury",
        prompt_suffix: "luxury photography",
        use_case: "Premium Brand",
        base_ctr: 0.052,
        base_engagement: 9.1,
        cost_per_hour: 200.0,
        hours_per_shot: 5.0,
    },
    CampaignVariation {
        name: "Outdoor",
        prompt_suffix: "outdoor photography",
        use_case: "Outdoor Brand",
        base_ctr: 0.041,
        base_engagement: 8.7,
        cost_per_hour: 120.0,
        hours_per_shot: 3.5,
    },
];

/// First `count` variations, capped at the catalog size.
pub fn campaign_variations(count: usize) -> &'static [CampaignVariation] {
    &CAMPAIGN_VARIATIONS[..count.min(MAX_VARIATIONS)]
}

pub fn find_variation(id: &str) -> Option<&'static CampaignVariation> {
    let wanted = id.trim();
    CAMPAIGN_VARIATIONS
        .iter()
        .find(|variation| variation.name.eq_ignore_ascii_case(wanted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_caps_requested_count() {
        assert_eq!(campaign_variations(2).len(), 2);
        assert_eq!(campaign_variations(40).len(), MAX_VARIATIONS);
        assert!(campaign_variations(0).is_empty());
    }

    #[test]
    fn metrics_derive_cost_from_studio_rates() {
        let minimalist = find_variation("minimalist").map(CampaignVariation::metrics);
        let metrics = minimalist.unwrap_or_default();
        assert_eq!(metrics.cost_saved, 200.0);
        assert_eq!(metrics.time_saved_hours, 2.5);
        assert_eq!(metrics.predicted_ctr, 0.035);
        assert!(find_variation("Baroque").is_none());
    }

    #[test]
    fn variation_ids_are_lowercase_names() {
        let ids: Vec<String> = campaign_variations(3).iter().map(CampaignVariation::id).collect();
        assert_eq!(ids, vec!["lifestyle", "commercial", "editorial"]);
    }
}
