//! Canonical vocabularies: brand/model aliases, fuel/gearbox/body word maps
//! (Bulgarian primary, English secondary), and the closed region set.
//!
//! The brand catalog is loaded from the `brand_models` table per use, so
//! alias-table edits take effect without restart and draft listings become
//! resolvable on their next pass.

use std::collections::HashMap;

use anyhow::Result;
use lazy_static::lazy_static;

use crate::models::{Body, Fuel, Gearbox};
use crate::similarity::normalize_text;
use crate::store::Store;

/// How the brand/model was resolved, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchQuality {
    Exact,
    Alias,
    Fuzzy,
}

#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub brand_id: String,
    pub model_id: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BrandCatalog {
    models: Vec<ModelEntry>,
    brand_names: HashMap<String, String>,
}

lazy_static! {
    /// Brand spellings beyond the canonical id, Bulgarian included.
    static ref BRAND_ALIASES: HashMap<&'static str, Vec<&'static str>> = {
        let mut m = HashMap::new();
        m.insert("bmw", vec!["бмв"]);
        m.insert("vw", vec!["volkswagen", "фолксваген", "фв"]);
        m.insert("audi", vec!["ауди"]);
        m.insert("mercedes", vec!["mercedes-benz", "мерцедес", "benz"]);
        m.insert("opel", vec!["опел"]);
        m.insert("toyota", vec!["тойота"]);
        m.insert("ford", vec!["форд"]);
        m.insert("renault", vec!["рено"]);
        m.insert("peugeot", vec!["пежо"]);
        m.insert("skoda", vec!["шкода"]);
        m.insert("honda", vec!["хонда"]);
        m.insert("nissan", vec!["нисан"]);
        m
    };

    // keys are normalize_text() forms so lookups and map agree on spelling
    static ref FUEL_WORDS: HashMap<String, Fuel> = {
        let mut m = HashMap::new();
        for w in ["diesel", "дизел", "дизелов"] {
            m.insert(normalize_text(w), Fuel::Diesel);
        }
        for w in ["petrol", "gasoline", "benzin", "бензин", "бензинов"] {
            m.insert(normalize_text(w), Fuel::Petrol);
        }
        for w in ["hybrid", "хибрид", "хибриден"] {
            m.insert(normalize_text(w), Fuel::Hybrid);
        }
        for w in ["electric", "ev", "електрически", "електро"] {
            m.insert(normalize_text(w), Fuel::Electric);
        }
        for w in ["lpg", "газ", "газов"] {
            m.insert(normalize_text(w), Fuel::Lpg);
        }
        for w in ["cng", "метан"] {
            m.insert(normalize_text(w), Fuel::Cng);
        }
        m
    };

    static ref GEARBOX_WORDS: HashMap<String, Gearbox> = {
        let mut m = HashMap::new();
        for w in ["automatic", "auto", "автомат", "автоматик", "автоматична", "автоматични"] {
            m.insert(normalize_text(w), Gearbox::Automatic);
        }
        for w in ["manual", "ръчна", "ръчни", "механична"] {
            m.insert(normalize_text(w), Gearbox::Manual);
        }
        for w in ["semi-auto", "semi_auto", "semiauto", "полуавтомат", "полуавтоматична"] {
            m.insert(normalize_text(w), Gearbox::SemiAuto);
        }
        m
    };

    static ref BODY_WORDS: HashMap<String, Body> = {
        let mut m = HashMap::new();
        for w in ["sedan", "седан"] {
            m.insert(normalize_text(w), Body::Sedan);
        }
        for w in ["hatchback", "хечбек", "хетчбек"] {
            m.insert(normalize_text(w), Body::Hatchback);
        }
        for w in ["estate", "wagon", "комби"] {
            m.insert(normalize_text(w), Body::Estate);
        }
        for w in ["suv", "джип"] {
            m.insert(normalize_text(w), Body::Suv);
        }
        for w in ["coupe", "купе", "коупе"] {
            m.insert(normalize_text(w), Body::Coupe);
        }
        for w in ["convertible", "кабрио", "кабриолет"] {
            m.insert(normalize_text(w), Body::Convertible);
        }
        for w in ["van", "ван", "бус"] {
            m.insert(normalize_text(w), Body::Van);
        }
        for w in ["pickup", "пикап"] {
            m.insert(normalize_text(w), Body::Pickup);
        }
        m
    };

    /// (canonical region, aliases, parent). Parent is the containing
    /// province for town-level entries; matching tolerates one level.
    static ref REGIONS: Vec<(&'static str, Vec<&'static str>, Option<&'static str>)> = vec![
        ("sofia", vec!["софия", "софия град", "sofia city", "гр софия"], None),
        ("plovdiv", vec!["пловдив"], None),
        ("varna", vec!["варна"], None),
        ("burgas", vec!["бургас"], None),
        ("ruse", vec!["русе"], None),
        ("stara-zagora", vec!["стара загора"], None),
        ("pleven", vec!["плевен"], None),
        ("veliko-tarnovo", vec!["велико търново", "в търново"], None),
        ("blagoevgrad", vec!["благоевград"], None),
        ("pazardzhik", vec!["пазарджик"], None),
        ("dobrich", vec!["добрич"], None),
        ("sliven", vec!["сливен"], None),
        ("shumen", vec!["шумен"], None),
        ("haskovo", vec!["хасково"], None),
        ("vratsa", vec!["враца"], None),
        ("gabrovo", vec!["габрово"], None),
        ("pernik", vec!["перник"], None),
        ("kyustendil", vec!["кюстендил"], None),
        ("montana", vec!["монтана"], None),
        ("vidin", vec!["видин"], None),
        ("lovech", vec!["ловеч"], None),
        ("razgrad", vec!["разград"], None),
        ("silistra", vec!["силистра"], None),
        ("targovishte", vec!["търговище"], None),
        ("smolyan", vec!["смолян"], None),
        ("yambol", vec!["ямбол"], None),
        ("kardzhali", vec!["кърджали"], None),
        // town-level entries with their province as parent
        ("bansko", vec!["банско"], Some("blagoevgrad")),
        ("nesebar", vec!["несебър"], Some("burgas")),
        ("asenovgrad", vec!["асеновград"], Some("plovdiv")),
        ("kazanlak", vec!["казанлък"], Some("stara-zagora")),
        ("gorna-oryahovitsa", vec!["горна оряховица"], Some("veliko-tarnovo")),
    ];
}

pub fn fuel_from_word(word: &str) -> Option<Fuel> {
    FUEL_WORDS.get(&normalize_text(word)).copied()
}

pub fn gearbox_from_word(word: &str) -> Option<Gearbox> {
    GEARBOX_WORDS.get(&normalize_text(word)).copied()
}

pub fn body_from_word(word: &str) -> Option<Body> {
    BODY_WORDS.get(&normalize_text(word)).copied()
}

/// Canonicalize a region word or phrase.
pub fn region_from_word(word: &str) -> Option<&'static str> {
    let norm = normalize_text(word);
    for (canon, aliases, _) in REGIONS.iter() {
        if normalize_text(canon) == norm || aliases.iter().any(|a| normalize_text(a) == norm) {
            return Some(canon);
        }
    }
    None
}

/// True when the regions are equal or one directly contains the other.
pub fn region_matches(listing_region: &str, filter_region: &str) -> bool {
    if listing_region == filter_region {
        return true;
    }
    let parent_of = |r: &str| -> Option<&'static str> {
        REGIONS
            .iter()
            .find(|(canon, _, _)| *canon == r)
            .and_then(|(_, _, parent)| *parent)
    };
    parent_of(listing_region) == Some(filter_region)
        || parent_of(filter_region) == Some(listing_region)
}

impl BrandCatalog {
    pub fn load(store: &Store) -> Result<Self> {
        let mut models = Vec::new();
        store.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT brand_id, model_id, aliases FROM brand_models WHERE active = 1",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (brand_id, model_id, aliases_json) = row?;
                let aliases: Vec<String> =
                    serde_json::from_str(&aliases_json).unwrap_or_default();
                models.push(ModelEntry {
                    brand_id,
                    model_id,
                    aliases,
                });
            }
            Ok(())
        })?;

        let mut brand_names = HashMap::new();
        for entry in &models {
            brand_names.insert(entry.brand_id.clone(), entry.brand_id.clone());
            if let Some(aliases) = BRAND_ALIASES.get(entry.brand_id.as_str()) {
                for alias in aliases {
                    brand_names.insert(normalize_text(alias), entry.brand_id.clone());
                }
            }
        }
        Ok(Self {
            models,
            brand_names,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Resolve a brand word to its canonical id.
    pub fn brand_from_word(&self, word: &str) -> Option<String> {
        self.brand_names.get(&normalize_text(word)).cloned()
    }

    /// Resolve a model phrase within a brand: exact id, then alias set, then
    /// fuzzy (edit distance <= 2 on names of at least 4 chars).
    pub fn model_within_brand(&self, brand_id: &str, phrase: &str) -> Option<(String, MatchQuality)> {
        let norm = normalize_text(phrase);
        if norm.is_empty() {
            return None;
        }
        let entries: Vec<&ModelEntry> = self
            .models
            .iter()
            .filter(|e| e.brand_id == brand_id)
            .collect();

        for e in &entries {
            if normalize_text(&e.model_id) == norm {
                return Some((e.model_id.clone(), MatchQuality::Exact));
            }
        }
        for e in &entries {
            if e.aliases.iter().any(|a| normalize_text(a) == norm) {
                return Some((e.model_id.clone(), MatchQuality::Alias));
            }
        }
        if norm.chars().count() >= 4 {
            let mut best: Option<(String, usize)> = None;
            for e in &entries {
                let mut names: Vec<String> = vec![normalize_text(&e.model_id)];
                names.extend(e.aliases.iter().map(|a| normalize_text(a)));
                for name in names {
                    let dist = strsim::levenshtein(&norm, &name);
                    if dist <= 2 && best.as_ref().map_or(true, |(_, d)| dist < *d) {
                        best = Some((e.model_id.clone(), dist));
                    }
                }
            }
            if let Some((model_id, _)) = best {
                return Some((model_id, MatchQuality::Fuzzy));
            }
        }
        None
    }

    /// Resolve free-form brand and model strings to canonical ids. The model
    /// phrase may also carry the brand ("bmw x5"), so brand words are
    /// stripped before model matching.
    pub fn resolve(
        &self,
        brand_raw: Option<&str>,
        model_raw: Option<&str>,
        title: Option<&str>,
    ) -> Option<(String, String, MatchQuality)> {
        let brand_id = brand_raw
            .and_then(|b| self.brand_from_word(b))
            .or_else(|| {
                // scan the title for a known brand word
                let title = normalize_text(title?);
                title
                    .split(' ')
                    .find_map(|w| self.brand_names.get(w).cloned())
            })?;

        let candidates: Vec<String> = [model_raw, title]
            .iter()
            .flatten()
            .map(|s| {
                // strip brand words so "bmw x5" matches model "x5"
                normalize_text(s)
                    .split(' ')
                    .filter(|w| !self.brand_names.contains_key(*w))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();

        for cand in &candidates {
            if let Some((model_id, q)) = self.model_within_brand(&brand_id, cand) {
                return Some((brand_id, model_id, q));
            }
            // then word-by-word and bigrams, longest phrases first
            let words: Vec<&str> = cand.split(' ').filter(|w| !w.is_empty()).collect();
            for len in (1..=2.min(words.len())).rev() {
                for window in words.windows(len) {
                    if let Some((model_id, q)) =
                        self.model_within_brand(&brand_id, &window.join(" "))
                    {
                        return Some((brand_id, model_id, q));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> BrandCatalog {
        let store = Store::open_in_memory().unwrap();
        BrandCatalog::load(&store).unwrap()
    }

    #[test]
    fn brand_resolves_cyrillic_alias() {
        let cat = catalog();
        assert_eq!(cat.brand_from_word("БМВ").as_deref(), Some("bmw"));
        assert_eq!(cat.brand_from_word("фолксваген").as_deref(), Some("vw"));
        assert!(cat.brand_from_word("ferrari").is_none());
    }

    #[test]
    fn model_match_exact_then_alias_then_fuzzy() {
        let cat = catalog();
        assert_eq!(
            cat.model_within_brand("bmw", "x5"),
            Some(("x5".into(), MatchQuality::Exact))
        );
        assert_eq!(
            cat.model_within_brand("bmw", "320d"),
            Some(("3-series".into(), MatchQuality::Alias))
        );
        // one transposition away from "octavia"
        assert_eq!(
            cat.model_within_brand("skoda", "ocatvia").map(|(_, q)| q),
            Some(MatchQuality::Fuzzy)
        );
    }

    #[test]
    fn resolve_from_title_alone() {
        let cat = catalog();
        let (brand, model, _) = cat
            .resolve(None, None, Some("BMW X5 3.0d xDrive"))
            .expect("resolves");
        assert_eq!(brand, "bmw");
        assert_eq!(model, "x5");
    }

    #[test]
    fn region_containment_single_level() {
        assert_eq!(region_from_word("София"), Some("sofia"));
        assert!(region_matches("bansko", "blagoevgrad"));
        assert!(region_matches("blagoevgrad", "bansko"));
        assert!(!region_matches("bansko", "plovdiv"));
    }

    #[test]
    fn vocab_maps_bulgarian_variants() {
        assert_eq!(fuel_from_word("дизел"), Some(Fuel::Diesel));
        assert_eq!(gearbox_from_word("автоматик"), Some(Gearbox::Automatic));
        assert_eq!(body_from_word("комби"), Some(Body::Estate));
        assert_eq!(fuel_from_word("въглища"), None);
    }
}
