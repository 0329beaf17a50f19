//! Two-stage lookups: resolve a sample's identifier by name, then fetch the
//! records for that identifier at a single position and summarise them.

use std::collections::BTreeMap;
use std::io::Write;

use tracing::debug;

use crate::error::{Error, Result};
use crate::genomics::{
    GenomicsApi, SearchCallSetsRequest, SearchReadGroupSetsRequest, SearchReadsRequest,
    SearchVariantsRequest, Variant, VariantCall,
};

/// What to look up and where.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub dataset_id: String,
    pub variant_set_id: String,
    pub sample: String,
    pub reference_name: String,
    pub position: i64,
    pub page_size: u32,
}

/// Occurrences of each base at the target position.
pub type BaseTally = BTreeMap<char, usize>;

/// Result of a search-by-name call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(String),
    WrongCount(usize),
}

impl Lookup {
    fn from_ids(mut ids: Vec<String>) -> Self {
        if ids.len() == 1 {
            Self::Found(ids.remove(0))
        } else {
            Self::WrongCount(ids.len())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadsOutcome {
    Tally(BaseTally),
    WrongReadGroupSetCount(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariantOutcome {
    Called { name: String, genotype: Vec<String> },
    WrongCallSetCount(usize),
    NoCall,
}

pub async fn resolve_read_group_set<A>(api: &A, query: &Query) -> Result<Lookup>
where
    A: GenomicsApi + ?Sized,
{
    let read_group_sets = api
        .search_read_group_sets(&SearchReadGroupSetsRequest {
            dataset_ids: vec![query.dataset_id.clone()],
            name: query.sample.clone(),
        })
        .await?;
    Ok(Lookup::from_ids(
        read_group_sets.into_iter().map(|set| set.id).collect(),
    ))
}

pub async fn resolve_call_set<A>(api: &A, query: &Query) -> Result<Lookup>
where
    A: GenomicsApi + ?Sized,
{
    let call_sets = api
        .search_call_sets(&SearchCallSetsRequest {
            variant_set_ids: vec![query.variant_set_id.clone()],
            name: query.sample.clone(),
        })
        .await?;
    Ok(Lookup::from_ids(
        call_sets.into_iter().map(|set| set.id).collect(),
    ))
}

/// Exclusive end of the one-base interval starting at `position`.
fn interval_end(position: i64) -> Result<i64> {
    position
        .checked_add(1)
        .ok_or(Error::InvalidPosition(position))
}

/// Counts the bases the sample's reads carry at the query position.
pub async fn count_bases<A>(api: &A, query: &Query) -> Result<ReadsOutcome>
where
    A: GenomicsApi + ?Sized,
{
    let end = interval_end(query.position)?;
    let read_group_set_id = match resolve_read_group_set(api, query).await? {
        Lookup::Found(id) => id,
        Lookup::WrongCount(count) => return Ok(ReadsOutcome::WrongReadGroupSetCount(count)),
    };

    let reads = api
        .search_reads(&SearchReadsRequest {
            read_group_set_ids: vec![read_group_set_id],
            reference_name: query.reference_name.clone(),
            start: query.position,
            end,
            page_size: query.page_size,
        })
        .await?;
    debug!(count = reads.len(), "fetched reads");

    let placed = reads.iter().filter_map(|read| {
        let placement = read.placement();
        if placement.is_none() {
            debug!("skipping read without alignment or sequence");
        }
        placement
    });
    tally_bases(placed, query.position).map(ReadsOutcome::Tally)
}

/// Tallies the base found at `target` in each `(start, sequence)` record.
///
/// The offset is `target - start`; insertions and deletions in the alignment
/// are not taken into account.
pub fn tally_bases<'a, I>(records: I, target: i64) -> Result<BaseTally>
where
    I: IntoIterator<Item = (i64, &'a str)>,
{
    let mut tally = BaseTally::new();
    for (start, sequence) in records {
        let base = target
            .checked_sub(start)
            .and_then(|offset| usize::try_from(offset).ok())
            .and_then(|offset| sequence.as_bytes().get(offset))
            .ok_or(Error::OffsetOutOfRange {
                start,
                target,
                len: sequence.len(),
            })?;
        *tally.entry(char::from(*base)).or_default() += 1;
    }
    Ok(tally)
}

/// Finds the genotype called for the sample at the query position.
pub async fn call_genotype<A>(api: &A, query: &Query) -> Result<VariantOutcome>
where
    A: GenomicsApi + ?Sized,
{
    let end = interval_end(query.position)?;
    let call_set_id = match resolve_call_set(api, query).await? {
        Lookup::Found(id) => id,
        Lookup::WrongCount(count) => return Ok(VariantOutcome::WrongCallSetCount(count)),
    };

    let variants = api
        .search_variants(&SearchVariantsRequest {
            call_set_ids: vec![call_set_id],
            reference_name: query.reference_name.clone(),
            start: query.position,
            end,
        })
        .await?;
    debug!(count = variants.len(), "fetched variants");

    let Some(variant) = variants.first() else {
        return Ok(VariantOutcome::NoCall);
    };
    let Some(call) = variant.calls.first() else {
        return Ok(VariantOutcome::NoCall);
    };

    Ok(VariantOutcome::Called {
        name: variant.display_name().to_string(),
        genotype: called_genotype(variant, call)?,
    })
}

/// Maps each allele index of `call` to its bases: 0 is the reference,
/// k > 0 the k-th alternate, and a negative index (no call) is `.`.
pub fn called_genotype(variant: &Variant, call: &VariantCall) -> Result<Vec<String>> {
    call.genotype
        .iter()
        .map(|&index| match index {
            0 => Ok(variant.reference_bases.clone()),
            i if i < 0 => Ok(".".to_string()),
            i => usize::try_from(i - 1)
                .ok()
                .and_then(|alt| variant.alternate_bases.get(alt))
                .cloned()
                .ok_or(Error::GenotypeIndex {
                    index: i,
                    alternates: variant.alternate_bases.len(),
                }),
        })
        .collect()
}

/// Runs the reads then the variants lookup, writing results to `out` and
/// diagnostics to `diag`. A lookup that does not find exactly one identifier
/// ends the run early without an error.
pub async fn run<A, O, D>(api: &A, query: &Query, out: &mut O, diag: &mut D) -> Result<()>
where
    A: GenomicsApi + ?Sized,
    O: Write,
    D: Write,
{
    match count_bases(api, query).await? {
        ReadsOutcome::Tally(tally) => {
            writeln!(
                out,
                "{} bases on {} at {} are",
                query.sample, query.reference_name, query.position
            )?;
            for (base, count) in &tally {
                writeln!(out, "{base}: {count}")?;
            }
        }
        ReadsOutcome::WrongReadGroupSetCount(count) => {
            debug!(count, "read group set search matched the wrong number of sets");
            writeln!(
                diag,
                "Searching for {} didn't return the right number of read group sets",
                query.sample
            )?;
            return Ok(());
        }
    }

    match call_genotype(api, query).await? {
        VariantOutcome::Called { name, genotype } => {
            writeln!(out, "the called genotype is {} at {name}", genotype.join(","))?;
        }
        VariantOutcome::WrongCallSetCount(count) => {
            debug!(count, "call set search matched the wrong number of sets");
            writeln!(
                diag,
                "Searching for {} didn't return the right number of call sets",
                query.sample
            )?;
        }
        VariantOutcome::NoCall => {
            writeln!(
                diag,
                "No variant calls for {} at {}:{}",
                query.sample, query.reference_name, query.position
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::genomics::{CallSet, LinearAlignment, Position, Read, ReadGroupSet};

    #[derive(Default)]
    struct FakeGenomics {
        read_group_sets: Vec<ReadGroupSet>,
        reads: Vec<Read>,
        call_sets: Vec<CallSet>,
        variants: Vec<Variant>,
        reads_requests: Mutex<Vec<SearchReadsRequest>>,
        variants_requests: Mutex<Vec<SearchVariantsRequest>>,
    }

    #[async_trait]
    impl GenomicsApi for FakeGenomics {
        async fn search_read_group_sets(
            &self,
            _request: &SearchReadGroupSetsRequest,
        ) -> Result<Vec<ReadGroupSet>> {
            Ok(self.read_group_sets.clone())
        }

        async fn search_reads(&self, request: &SearchReadsRequest) -> Result<Vec<Read>> {
            self.reads_requests.lock().unwrap().push(request.clone());
            Ok(self.reads.clone())
        }

        async fn search_call_sets(&self, _request: &SearchCallSetsRequest) -> Result<Vec<CallSet>> {
            Ok(self.call_sets.clone())
        }

        async fn search_variants(&self, request: &SearchVariantsRequest) -> Result<Vec<Variant>> {
            self.variants_requests.lock().unwrap().push(request.clone());
            Ok(self.variants.clone())
        }
    }

    fn query() -> Query {
        Query {
            dataset_id: "ds".to_string(),
            variant_set_id: "vs".to_string(),
            sample: "NA12872".to_string(),
            reference_name: "22".to_string(),
            position: 102,
            page_size: 1024,
        }
    }

    fn read_group_set(id: &str) -> ReadGroupSet {
        ReadGroupSet { id: id.to_string() }
    }

    fn call_set(id: &str) -> CallSet {
        CallSet { id: id.to_string() }
    }

    fn read(start: i64, sequence: &str) -> Read {
        Read {
            alignment: Some(LinearAlignment {
                position: Some(Position { position: start }),
            }),
            aligned_sequence: Some(sequence.to_string()),
        }
    }

    fn variant(genotype: Vec<i32>) -> Variant {
        Variant {
            id: "v1".to_string(),
            names: vec!["rs1234".to_string()],
            reference_bases: "A".to_string(),
            alternate_bases: vec!["T".to_string()],
            calls: vec![VariantCall { genotype }],
        }
    }

    async fn run_to_strings(api: &FakeGenomics) -> (String, String) {
        let mut out = Vec::new();
        let mut diag = Vec::new();
        run(api, &query(), &mut out, &mut diag).await.unwrap();
        (String::from_utf8(out).unwrap(), String::from_utf8(diag).unwrap())
    }

    #[test]
    fn tally_indexes_each_record_at_its_offset() {
        let tally = tally_bases([(100, "ACGT"), (101, "CGTA")], 102).unwrap();
        assert_eq!(tally, BaseTally::from([('G', 2)]));

        let tally = tally_bases([(100, "ACGT"), (101, "GTAC")], 102).unwrap();
        assert_eq!(tally, BaseTally::from([('G', 1), ('T', 1)]));
    }

    #[test]
    fn tally_rejects_reads_not_covering_target() {
        let err = tally_bases([(100, "AC")], 102).unwrap_err();
        assert!(matches!(
            err,
            Error::OffsetOutOfRange {
                start: 100,
                target: 102,
                len: 2
            }
        ));
        assert!(tally_bases([(103, "ACGT")], 102).is_err());
    }

    #[test]
    fn tally_survives_extreme_coordinates() {
        let err = tally_bases([(i64::MIN, "ACGT")], 102).unwrap_err();
        assert!(matches!(err, Error::OffsetOutOfRange { start: i64::MIN, .. }));

        let err = tally_bases([(i64::MAX, "ACGT")], i64::MIN).unwrap_err();
        assert!(matches!(err, Error::OffsetOutOfRange { .. }));
    }

    #[tokio::test]
    async fn last_representable_position_is_rejected_before_searching() {
        let api = FakeGenomics {
            read_group_sets: vec![read_group_set("rgs-1")],
            call_sets: vec![call_set("cs-1")],
            ..Default::default()
        };
        let query = Query {
            position: i64::MAX,
            ..query()
        };

        let err = count_bases(&api, &query).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPosition(i64::MAX)));
        assert_eq!(err.exit_code(), 1);

        let err = call_genotype(&api, &query).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPosition(i64::MAX)));

        assert!(api.reads_requests.lock().unwrap().is_empty());
        assert!(api.variants_requests.lock().unwrap().is_empty());
    }

    #[test]
    fn genotype_maps_reference_and_alternates() {
        let v = variant(vec![0, 1]);
        assert_eq!(called_genotype(&v, &v.calls[0]).unwrap(), vec!["A", "T"]);

        let v = variant(vec![-1, 1]);
        assert_eq!(called_genotype(&v, &v.calls[0]).unwrap(), vec![".", "T"]);

        let v = variant(vec![0, 2]);
        assert!(matches!(
            called_genotype(&v, &v.calls[0]),
            Err(Error::GenotypeIndex {
                index: 2,
                alternates: 1
            })
        ));
    }

    #[tokio::test]
    async fn wrong_read_group_set_count_skips_record_fetch() {
        for sets in [vec![], vec![read_group_set("a"), read_group_set("b")]] {
            let api = FakeGenomics {
                read_group_sets: sets,
                call_sets: vec![call_set("cs-1")],
                ..Default::default()
            };

            let (out, diag) = run_to_strings(&api).await;

            assert!(out.is_empty());
            assert_eq!(
                diag,
                "Searching for NA12872 didn't return the right number of read group sets\n"
            );
            assert!(api.reads_requests.lock().unwrap().is_empty());
            assert!(api.variants_requests.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn single_match_fetches_reads_for_that_id() {
        let api = FakeGenomics {
            read_group_sets: vec![read_group_set("rgs-1")],
            reads: vec![read(100, "ACGT"), read(101, "GTAC"), Read::default()],
            ..Default::default()
        };

        let outcome = count_bases(&api, &query()).await.unwrap();

        assert_eq!(
            outcome,
            ReadsOutcome::Tally(BaseTally::from([('G', 1), ('T', 1)]))
        );
        assert_eq!(
            api.reads_requests.lock().unwrap().as_slice(),
            &[SearchReadsRequest {
                read_group_set_ids: vec!["rgs-1".to_string()],
                reference_name: "22".to_string(),
                start: 102,
                end: 103,
                page_size: 1024,
            }]
        );
    }

    #[tokio::test]
    async fn full_run_prints_tally_and_genotype() {
        let api = FakeGenomics {
            read_group_sets: vec![read_group_set("rgs-1")],
            reads: vec![read(100, "ACGT"), read(101, "GTAC"), read(102, "GA")],
            call_sets: vec![call_set("cs-1")],
            variants: vec![variant(vec![0, 1])],
            ..Default::default()
        };

        let (out, diag) = run_to_strings(&api).await;

        assert_eq!(
            out,
            "NA12872 bases on 22 at 102 are\nG: 2\nT: 1\nthe called genotype is A,T at rs1234\n"
        );
        assert!(diag.is_empty());
        assert_eq!(
            api.variants_requests.lock().unwrap().as_slice(),
            &[SearchVariantsRequest {
                call_set_ids: vec!["cs-1".to_string()],
                reference_name: "22".to_string(),
                start: 102,
                end: 103,
            }]
        );
    }

    #[tokio::test]
    async fn wrong_call_set_count_skips_variant_fetch() {
        let api = FakeGenomics {
            read_group_sets: vec![read_group_set("rgs-1")],
            reads: vec![read(102, "C")],
            ..Default::default()
        };

        let (out, diag) = run_to_strings(&api).await;

        assert_eq!(out, "NA12872 bases on 22 at 102 are\nC: 1\n");
        assert_eq!(
            diag,
            "Searching for NA12872 didn't return the right number of call sets\n"
        );
        assert!(api.variants_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_variant_at_position_is_reported() {
        let api = FakeGenomics {
            read_group_sets: vec![read_group_set("rgs-1")],
            call_sets: vec![call_set("cs-1")],
            ..Default::default()
        };

        let outcome = call_genotype(&api, &query()).await.unwrap();
        assert_eq!(outcome, VariantOutcome::NoCall);
    }
}
