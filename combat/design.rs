use crate::data::CombatInput;
use crate::estimate::CombatError;
use itertools::Itertools;
use ndarray::{Array2, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A categorical -> indicator mapping learned once at fit time.
///
/// Categories are kept sorted so that the column order (and therefore the dropped
/// reference level) does not depend on sample order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    categories: Vec<String>,
}

impl CategoryEncoder {
    pub fn fit<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let categories = values
            .into_iter()
            .map(|v| v.as_ref().to_string())
            .sorted()
            .dedup()
            .collect();
        Self { categories }
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn index_of(&self, value: &str) -> Option<usize> {
        self.categories
            .binary_search_by(|c| c.as_str().cmp(value))
            .ok()
    }

    /// Maps every value to its category index. Unknown values are collected and
    /// reported together rather than one at a time.
    pub fn indices<I, S>(&self, values: I, encoder_name: &str) -> Result<Vec<usize>, CombatError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut indices = Vec::new();
        let mut unseen = Vec::new();
        for value in values {
            let value = value.as_ref();
            match self.index_of(value) {
                Some(idx) => indices.push(idx),
                None => unseen.push(value.to_string()),
            }
        }
        if unseen.is_empty() {
            Ok(indices)
        } else {
            Err(CombatError::UnseenCategory {
                encoder: encoder_name.to_string(),
                values: unseen.into_iter().sorted().dedup().collect(),
            })
        }
    }

    /// Full one-hot encoding, one column per category.
    pub fn one_hot<I, S>(&self, values: I, encoder_name: &str) -> Result<Array2<f64>, CombatError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let indices = self.indices(values, encoder_name)?;
        let mut encoded = Array2::zeros((indices.len(), self.len()));
        for (row, &col) in indices.iter().enumerate() {
            encoded[[row, col]] = 1.0;
        }
        Ok(encoded)
    }
}

/// Encoders for every categorical block of the design, plus the shape of the
/// continuous block. Presence of each covariate kind is recorded so transform-time
/// inputs can be checked against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignEncoders {
    n_continuous: Option<usize>,
    site: CategoryEncoder,
    discrete: Option<Vec<CategoryEncoder>>,
}

impl DesignEncoders {
    /// Learns encoders from fit-time inputs.
    pub fn fit(input: &CombatInput<'_>) -> Self {
        let site = CategoryEncoder::fit(input.sites());
        let discrete = input.discrete().map(|covariates| {
            covariates
                .axis_iter(Axis(1))
                .map(|column| CategoryEncoder::fit(column.iter()))
                .collect()
        });
        let n_continuous = input.continuous().map(|c| c.ncols());
        Self {
            site,
            discrete,
            n_continuous,
        }
    }

    pub fn n_sites(&self) -> usize {
        self.site.len()
    }

    pub fn site_names(&self) -> &[String] {
        self.site.categories()
    }

    pub fn site_encoder(&self) -> &CategoryEncoder {
        &self.site
    }

    pub fn discrete_encoders(&self) -> Option<&[CategoryEncoder]> {
        self.discrete.as_deref()
    }

    pub fn n_continuous(&self) -> Option<usize> {
        self.n_continuous
    }

    /// Total number of design columns:
    /// `n_sites + Σ(levels - 1) + n_continuous`.
    pub fn width(&self) -> usize {
        let discrete: usize = self
            .discrete
            .iter()
            .flatten()
            .map(|e| e.len().saturating_sub(1))
            .sum();
        self.n_sites() + discrete + self.n_continuous.unwrap_or(0)
    }

    /// Columns holding the site indicators, which act as per-site intercepts.
    pub fn site_columns(&self) -> Range<usize> {
        0..self.n_sites()
    }

    pub fn site_indices(&self, sites: &[String]) -> Result<Vec<usize>, CombatError> {
        self.site.indices(sites, "site")
    }

    /// Builds the design matrix in canonical column order: site indicators, then each
    /// discrete covariate with its reference level dropped, then continuous covariates.
    pub fn build(&self, input: &CombatInput<'_>) -> Result<Array2<f64>, CombatError> {
        let n_samples = input.n_samples();
        let discrete = match (&self.discrete, input.discrete()) {
            (Some(encoders), Some(values)) => Some((encoders, values)),
            (None, None) => None,
            (expected, _) => {
                return Err(CombatError::CovariateMismatch {
                    kind: "Discrete",
                    at_fit: expected.is_some(),
                });
            }
        };
        let continuous = match (self.n_continuous, input.continuous()) {
            (Some(width), Some(values)) => Some((width, values)),
            (None, None) => None,
            (expected, _) => {
                return Err(CombatError::CovariateMismatch {
                    kind: "Continuous",
                    at_fit: expected.is_some(),
                });
            }
        };

        let mut design = Array2::zeros((n_samples, self.width()));

        let site_block = self.site.one_hot(input.sites(), "site")?;
        design
            .slice_mut(s![.., self.site_columns()])
            .assign(&site_block);
        let mut col = self.n_sites();

        if let Some((encoders, values)) = discrete {
            if values.ncols() != encoders.len() {
                return Err(CombatError::ShapeMismatch(format!(
                    "{} discrete covariate columns were given but {} were used at fit time",
                    values.ncols(),
                    encoders.len()
                )));
            }
            for (i, (encoder, column)) in encoders.iter().zip(values.axis_iter(Axis(1))).enumerate()
            {
                let name = format!("discrete covariate {i}");
                let one_hot = encoder.one_hot(column.iter(), &name)?;
                let kept = one_hot.ncols().saturating_sub(1);
                design
                    .slice_mut(s![.., col..col + kept])
                    .assign(&one_hot.slice(s![.., 1..]));
                col += kept;
            }
        }

        if let Some((width, values)) = continuous {
            if values.ncols() != width {
                return Err(CombatError::ShapeMismatch(format!(
                    "{} continuous covariate columns were given but {} were used at fit time",
                    values.ncols(),
                    width
                )));
            }
            design.slice_mut(s![.., col..col + width]).assign(&values);
            col += width;
        }

        debug_assert_eq!(col, design.ncols());
        Ok(design)
    }
}

/// Groups sample indices by site, in encoder order. Sites absent from the data get an
/// empty group.
pub fn partition_by_site(site_of_sample: &[usize], n_sites: usize) -> Vec<Vec<usize>> {
    let mut partition = vec![Vec::new(); n_sites];
    for (sample, &site) in site_of_sample.iter().enumerate() {
        partition[site].push(sample);
    }
    partition
}

/// The same design with the site-indicator block zeroed, so that `design · beta_hat`
/// yields only the covariate contribution.
pub fn covariate_only(design: ArrayView2<'_, f64>, n_sites: usize) -> Array2<f64> {
    let mut covariates = design.to_owned();
    covariates.slice_mut(s![.., ..n_sites]).fill(0.0);
    covariates
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_encoder_sorts_and_deduplicates() {
        let encoder = CategoryEncoder::fit(["b", "a", "c", "a"]);
        assert_eq!(encoder.categories(), &["a", "b", "c"]);
        assert_eq!(encoder.index_of("c"), Some(2));
        assert_eq!(encoder.index_of("z"), None);
    }

    #[test]
    fn test_no_covariates_gives_site_block_only() {
        let features = array![[1.0], [2.0], [3.0], [4.0]];
        let sites = labels(&["s2", "s1", "s2", "s1"]);
        let input = CombatInput::new(features.view(), &sites);
        let encoders = DesignEncoders::fit(&input);
        let design = encoders.build(&input).unwrap();

        let expected = array![[0.0, 1.0], [1.0, 0.0], [0.0, 1.0], [1.0, 0.0]];
        assert_eq!(design, expected);
        for row in design.rows() {
            assert_eq!(row.sum(), 1.0);
        }
    }

    #[test]
    fn test_discrete_reference_level_is_dropped() {
        let features = array![[1.0], [2.0], [3.0], [4.0]];
        let sites = labels(&["A", "A", "B", "B"]);
        let discrete = Array2::from_shape_vec(
            (4, 1),
            labels(&["control", "patient", "patient", "other"]),
        )
        .unwrap();
        let continuous = array![[30.0], [41.0], [52.0], [63.0]];
        let input = CombatInput::new(features.view(), &sites)
            .with_discrete(discrete.view())
            .with_continuous(continuous.view());
        let encoders = DesignEncoders::fit(&input);
        assert_eq!(encoders.width(), 2 + 2 + 1);

        let design = encoders.build(&input).unwrap();
        // Levels sort as control, other, patient; control is the reference.
        let expected = array![
            [1.0, 0.0, 0.0, 0.0, 30.0],
            [1.0, 0.0, 0.0, 1.0, 41.0],
            [0.0, 1.0, 0.0, 1.0, 52.0],
            [0.0, 1.0, 1.0, 0.0, 63.0]
        ];
        assert_eq!(design, expected);
    }

    #[test]
    fn test_unseen_values_are_enumerated() {
        let features = array![[1.0], [2.0], [3.0], [4.0]];
        let sites = labels(&["A", "A", "B", "B"]);
        let encoders = DesignEncoders::fit(&CombatInput::new(features.view(), &sites));

        let new_sites = labels(&["A", "D", "C", "D"]);
        let err = encoders
            .build(&CombatInput::new(features.view(), &new_sites))
            .unwrap_err();
        match err {
            CombatError::UnseenCategory { encoder, values } => {
                assert_eq!(encoder, "site");
                assert_eq!(values, vec!["C".to_string(), "D".to_string()]);
            }
            other => panic!("Expected UnseenCategory, got {:?}", other),
        }
    }

    #[test]
    fn test_unseen_discrete_level_is_not_zero_encoded() {
        let features = array![[1.0], [2.0], [3.0], [4.0]];
        let sites = labels(&["A", "A", "B", "B"]);
        let discrete =
            Array2::from_shape_vec((4, 1), labels(&["hc", "sz", "hc", "sz"])).unwrap();
        let encoders = DesignEncoders::fit(
            &CombatInput::new(features.view(), &sites).with_discrete(discrete.view()),
        );

        let novel = Array2::from_shape_vec((4, 1), labels(&["hc", "bd", "hc", "sz"])).unwrap();
        let err = encoders
            .build(&CombatInput::new(features.view(), &sites).with_discrete(novel.view()))
            .unwrap_err();
        match err {
            CombatError::UnseenCategory { encoder, values } => {
                assert_eq!(encoder, "discrete covariate 0");
                assert_eq!(values, vec!["bd".to_string()]);
            }
            other => panic!("Expected UnseenCategory, got {:?}", other),
        }
    }

    #[test]
    fn test_covariate_presence_must_match_fit() {
        let features = array![[1.0], [2.0], [3.0], [4.0]];
        let sites = labels(&["A", "A", "B", "B"]);
        let continuous = array![[1.0], [2.0], [3.0], [5.0]];
        let encoders = DesignEncoders::fit(
            &CombatInput::new(features.view(), &sites).with_continuous(continuous.view()),
        );
        let err = encoders
            .build(&CombatInput::new(features.view(), &sites))
            .unwrap_err();
        assert!(matches!(
            err,
            CombatError::CovariateMismatch {
                kind: "Continuous",
                at_fit: true
            }
        ));
    }

    #[test]
    fn test_partition_and_covariate_only() {
        let partition = partition_by_site(&[1, 0, 1, 1], 3);
        assert_eq!(partition, vec![vec![1], vec![0, 2, 3], vec![]]);

        let design = array![[1.0, 0.0, 2.5], [0.0, 1.0, 3.5]];
        let covariates = covariate_only(design.view(), 2);
        assert_eq!(covariates, array![[0.0, 0.0, 2.5], [0.0, 0.0, 3.5]]);
    }
}
