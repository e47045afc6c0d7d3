use super::response::ResultSeries;
use crate::{models::QueryDefinition, settings::date_histogram_settings};

/// Drops `count` points from both ends of every series longer than `2 * count`.
pub fn trim_edges(series: &mut [ResultSeries], count: usize) {
    if count == 0 {
        return;
    }

    for series in series.iter_mut() {
        if series.points.len() > count.saturating_mul(2) {
            series.points.drain(..count);
            let keep = series.points.len() - count;
            series.points.truncate(keep);
        }
    }
}

/// Applies the `trimEdges` setting of the query's date histogram, if any.
pub fn trim_for_query(query: &QueryDefinition, series: &mut [ResultSeries]) {
    let count = query
        .date_histogram()
        .map(|stage| date_histogram_settings(&stage.settings).trim_edges())
        .unwrap_or(0);
    trim_edges(series, count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{query::response::DataPoint, time::from_epoch_millis};
    use serde_json::json;

    fn series(len: i64) -> ResultSeries {
        ResultSeries {
            name: "s".to_string(),
            labels: Default::default(),
            points: (0..len)
                .map(|ms| DataPoint {
                    timestamp: from_epoch_millis(ms).unwrap(),
                    value: Some(ms as f64),
                })
                .collect(),
        }
    }

    fn values(series: &ResultSeries) -> Vec<Option<f64>> {
        series.points.iter().map(|point| point.value).collect()
    }

    #[test]
    fn removes_exactly_two_n_points() {
        let mut output = vec![series(5)];
        trim_edges(&mut output, 2);
        assert_eq!(values(&output[0]), vec![Some(2.0)]);
    }

    #[test]
    fn short_series_are_left_alone() {
        let mut output = vec![series(4), series(3)];
        trim_edges(&mut output, 2);
        assert_eq!(output[0].points.len(), 4);
        assert_eq!(output[1].points.len(), 3);

        trim_edges(&mut output, 2);
        assert_eq!(output[0].points.len(), 4);
    }

    #[test]
    fn reads_trim_setting_from_date_histogram() {
        let query: QueryDefinition = serde_json::from_value(json!({
            "refId": "A",
            "bucketAggs": [
                {"id": "2", "type": "terms", "field": "host"},
                {"id": "3", "type": "date_histogram", "field": "@timestamp", "settings": {"trimEdges": "1"}}
            ],
            "metrics": [{"id": "1", "type": "count"}]
        }))
        .unwrap();

        let mut output = vec![series(4)];
        trim_for_query(&query, &mut output);
        assert_eq!(values(&output[0]), vec![Some(1.0), Some(2.0)]);
    }
}
